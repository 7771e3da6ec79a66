//! Pooled HTTP transport
//!
//! One reusable client for the request executor. Idle pooling and timeouts are
//! handled by reqwest; the per-host connection ceiling is enforced here with a
//! semaphore per host, since reqwest has no such knob.
//!
//! A slot covers the request until its response headers arrive. Streaming the
//! body afterwards is not counted against the ceiling.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Host limiters kept before idle ones are dropped
const MAX_TRACKED_HOSTS: usize = 64;

/// Pool sizing and client behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPoolConfig {
    pub max_idle_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub keep_alive: bool,
    /// Skip TLS peer verification. On by default: users routinely test
    /// endpoints with self-signed certificates.
    pub accept_invalid_certs: bool,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            max_conns_per_host: 20,
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            keep_alive: true,
            accept_invalid_certs: true,
        }
    }
}

/// Shared outbound client with per-host connection limits
#[derive(Debug, Clone)]
pub struct PooledTransport {
    client: reqwest::Client,
    config: HttpPoolConfig,
    hosts: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl PooledTransport {
    pub fn new(config: HttpPoolConfig) -> Result<Self> {
        if config.max_conns_per_host == 0 {
            anyhow::bail!("max_conns_per_host must be at least 1");
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        builder = if config.keep_alive {
            builder
                .pool_max_idle_per_host(config.max_idle_per_host)
                .pool_idle_timeout(config.idle_timeout)
                .tcp_keepalive(config.idle_timeout)
        } else {
            builder.pool_max_idle_per_host(0)
        };

        let client = builder.build().context("Failed to create HTTP client")?;

        if config.accept_invalid_certs {
            warn!("TLS certificate verification is disabled for outbound requests");
        }

        Ok(Self {
            client,
            config,
            hosts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn config(&self) -> &HttpPoolConfig {
        &self.config
    }

    fn host_limit(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        if let Some(limit) = hosts.get(host) {
            return limit.clone();
        }

        // A limiter referenced only by the map has no waiters and no permits out.
        if hosts.len() >= MAX_TRACKED_HOSTS {
            hosts.retain(|_, limit| Arc::strong_count(limit) > 1);
        }

        let limit = Arc::new(Semaphore::new(self.config.max_conns_per_host));
        hosts.insert(host.to_string(), limit.clone());
        limit
    }

    /// Wait for a connection slot to `host`
    pub async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        self.host_limit(host)
            .acquire_owned()
            .await
            .context("host connection limiter closed")
    }

    /// Connection slots to `host` not currently in use
    pub fn available(&self, host: &str) -> usize {
        self.host_limit(host).available_permits()
    }

    /// Send a request, holding a host slot until the response headers arrive.
    /// Reading the body happens outside the slot.
    pub async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let host = request.url().host_str().unwrap_or_default().to_string();
        let _permit = self.acquire(&host).await?;
        debug!(method = %request.method(), url = %request.url(), "sending request");
        self.client
            .execute(request)
            .await
            .with_context(|| format!("request to {host} failed"))
    }
}
