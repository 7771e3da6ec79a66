//! API-King backend core
//!
//! Local persistence for settings, call history and saved requests, a
//! background maintenance task that keeps the store file compact, and the
//! pooled HTTP transport used by the request executor.

pub mod app;
pub mod config;
pub mod logging;
pub mod maintenance;
pub mod storage;
pub mod transport;

pub use app::{ApiKingApp, VERSION};
pub use config::AppConfig;
pub use storage::{Database, StoreError};
