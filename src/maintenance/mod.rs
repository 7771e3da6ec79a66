//! Background store maintenance
//!
//! A single detached task compacts the store once shortly after startup and then
//! on a long fixed period for the rest of the process lifetime. Foreground callers
//! never await it; they only contend with it for the store connection while a
//! pass is running.
//!
//! The task is either `Idle` or `Compacting`. Cancellation is only observed while
//! idle, so a pass that has started always runs to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::storage::{Database, StoreError};

/// Something that can rebuild the store file
pub trait Compactor: Send + Sync + 'static {
    fn compact(&self) -> Result<(), StoreError>;
}

impl Compactor for Database {
    fn compact(&self) -> Result<(), StoreError> {
        Database::compact(self)
    }
}

/// When compaction passes fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    /// Delay before the one-shot pass, past the busiest startup I/O
    pub initial_delay: Duration,
    /// Period of the recurring pass, measured from scheduler start
    pub interval: Duration,
}

/// Longest delay or period the scheduler honours; longer values are clamped
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl MaintenanceSchedule {
    /// The schedule with both durations inside `[1s, MAX_PERIOD]` (delay may be 0)
    pub fn clamped(self) -> Self {
        Self {
            initial_delay: self.initial_delay.min(MAX_PERIOD),
            interval: self.interval.clamp(Duration::from_secs(1), MAX_PERIOD),
        }
    }
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            interval: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    Idle,
    Compacting,
}

/// Pass counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Completed passes, successful or not
    pub passes: u64,
    pub failures: u64,
    pub last_duration: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    failures: AtomicU64,
    last_duration_us: AtomicU64,
}

/// Handle to the running scheduler
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    state: watch::Receiver<MaintenanceState>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub fn state(&self) -> MaintenanceState {
        *self.state.borrow()
    }

    /// Receiver that observes every Idle/Compacting transition
    pub fn subscribe(&self) -> watch::Receiver<MaintenanceState> {
        self.state.clone()
    }

    pub fn stats(&self) -> MaintenanceStats {
        let passes = self.counters.passes.load(Ordering::Acquire);
        MaintenanceStats {
            passes,
            failures: self.counters.failures.load(Ordering::Acquire),
            last_duration: (passes > 0).then(|| {
                Duration::from_micros(self.counters.last_duration_us.load(Ordering::Acquire))
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop at the next Idle boundary and wait for the task to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "maintenance task ended abnormally");
        }
    }
}

/// Spawn the scheduler on `runtime`.
///
/// The task exits only when `cancel` fires.
pub fn start<C: Compactor>(
    runtime: &Handle,
    compactor: Arc<C>,
    schedule: MaintenanceSchedule,
    cancel: CancellationToken,
) -> MaintenanceHandle {
    let (state_tx, state_rx) = watch::channel(MaintenanceState::Idle);
    let counters = Arc::new(Counters::default());

    let clamped = schedule.clamped();
    if clamped != schedule {
        warn!(?schedule, ?clamped, "maintenance schedule out of range, clamped");
    }
    let schedule = clamped;

    let task = runtime.spawn(run(
        compactor,
        schedule,
        cancel.clone(),
        state_tx,
        counters.clone(),
    ));

    MaintenanceHandle {
        cancel,
        state: state_rx,
        counters,
        task,
    }
}

async fn run<C: Compactor>(
    compactor: Arc<C>,
    schedule: MaintenanceSchedule,
    cancel: CancellationToken,
    state: watch::Sender<MaintenanceState>,
    counters: Arc<Counters>,
) {
    info!(
        initial_delay_secs = schedule.initial_delay.as_secs(),
        interval_secs = schedule.interval.as_secs(),
        "maintenance scheduler started"
    );

    let started = Instant::now();
    let one_shot = tokio::time::sleep(schedule.initial_delay);
    tokio::pin!(one_shot);
    let mut one_shot_fired = false;

    // Ticks are anchored to the start time; a pass that overruns skips the
    // ticks it missed instead of replaying them back to back.
    let mut ticker = interval_at(started + schedule.interval, schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = &mut one_shot, if !one_shot_fired => {
                one_shot_fired = true;
                run_pass(&compactor, &state, &counters).await;
            }
            _ = ticker.tick() => {
                run_pass(&compactor, &state, &counters).await;
            }
        }
    }

    info!("maintenance scheduler stopped");
}

async fn run_pass<C: Compactor>(
    compactor: &Arc<C>,
    state: &watch::Sender<MaintenanceState>,
    counters: &Counters,
) {
    state.send_replace(MaintenanceState::Compacting);
    info!("background store compaction starting");
    let started = std::time::Instant::now();

    let job = compactor.clone();
    let result = tokio::task::spawn_blocking(move || job.compact()).await;
    let elapsed = started.elapsed();

    match result {
        Ok(Ok(())) => {
            info!(elapsed_ms = elapsed.as_millis() as u64, "background store compaction finished");
        }
        Ok(Err(e)) => {
            counters.failures.fetch_add(1, Ordering::AcqRel);
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "background store compaction failed"
            );
        }
        Err(e) => {
            counters.failures.fetch_add(1, Ordering::AcqRel);
            error!(
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "background store compaction panicked"
            );
        }
    }

    counters
        .last_duration_us
        .store(elapsed.as_micros() as u64, Ordering::Release);
    counters.passes.fetch_add(1, Ordering::AcqRel);
    state.send_replace(MaintenanceState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::mpsc;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    /// Counts calls and reports each one on a channel
    struct FakeCompactor {
        calls: AtomicUsize,
        fail_first: bool,
        work: Duration,
        finished: AtomicBool,
        tx: mpsc::UnboundedSender<usize>,
    }

    impl FakeCompactor {
        fn new(fail_first: bool, work: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<usize>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let compactor = Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
                work,
                finished: AtomicBool::new(false),
                tx,
            });
            (compactor, rx)
        }
    }

    impl Compactor for FakeCompactor {
        fn compact(&self) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.work.is_zero() {
                std::thread::sleep(self.work);
            }
            self.finished.store(true, Ordering::SeqCst);
            let _ = self.tx.send(call);
            if self.fail_first && call == 1 {
                return Err(StoreError::DataDir("simulated failure".to_string()));
            }
            Ok(())
        }
    }

    fn spawn_default(compactor: Arc<FakeCompactor>, cancel: CancellationToken) -> MaintenanceHandle {
        start(
            &Handle::current(),
            compactor,
            MaintenanceSchedule::default(),
            cancel,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_then_recurring() {
        let (compactor, mut rx) = FakeCompactor::new(false, Duration::ZERO);
        let begin = Instant::now();
        let handle = spawn_default(compactor.clone(), CancellationToken::new());

        assert_eq!(rx.recv().await, Some(1));
        let first = begin.elapsed();
        assert!(first >= Duration::from_secs(60) && first < Duration::from_secs(61));

        assert_eq!(rx.recv().await, Some(2));
        let second = begin.elapsed();
        assert!(second >= 12 * HOUR && second < 12 * HOUR + Duration::from_secs(1));

        assert_eq!(rx.recv().await, Some(3));
        let third = begin.elapsed();
        assert!(third >= 24 * HOUR && third < 24 * HOUR + Duration::from_secs(1));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_runs_before_initial_delay() {
        let (compactor, _rx) = FakeCompactor::new(false, Duration::ZERO);
        let handle = spawn_default(compactor.clone(), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(compactor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), MaintenanceState::Idle);
        assert_eq!(handle.stats(), MaintenanceStats::default());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_cancel_later_passes() {
        let (compactor, mut rx) = FakeCompactor::new(true, Duration::ZERO);
        let handle = spawn_default(compactor.clone(), CancellationToken::new());

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        // Counters are updated before the state returns to Idle.
        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == MaintenanceState::Idle)
            .await
            .unwrap();

        let stats = handle.stats();
        assert_eq!(stats.passes, 2);
        assert_eq!(stats.failures, 1);
        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_idle_skips_all_passes() {
        let (compactor, _rx) = FakeCompactor::new(false, Duration::ZERO);
        let handle = spawn_default(compactor.clone(), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.shutdown().await;

        tokio::time::sleep(48 * HOUR).await;
        assert_eq!(compactor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_pass() {
        let (compactor, _rx) = FakeCompactor::new(false, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let handle = spawn_default(compactor.clone(), cancel.clone());

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == MaintenanceState::Compacting)
            .await
            .unwrap();

        handle.shutdown().await;

        assert!(cancel.is_cancelled());
        assert!(compactor.finished.load(Ordering::SeqCst));
        assert_eq!(compactor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_schedule_is_clamped() {
        let (compactor, mut rx) = FakeCompactor::new(false, Duration::ZERO);
        let begin = Instant::now();
        let handle = start(
            &Handle::current(),
            compactor.clone(),
            MaintenanceSchedule {
                initial_delay: Duration::from_secs(60),
                interval: Duration::from_secs(u64::MAX),
            },
            CancellationToken::new(),
        );

        assert_eq!(rx.recv().await, Some(1));
        assert!(handle.is_running());

        assert_eq!(rx.recv().await, Some(2));
        let second = begin.elapsed();
        assert!(second >= MAX_PERIOD && second < MAX_PERIOD + Duration::from_secs(1));
        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[test]
    fn test_clamped_schedule() {
        let schedule = MaintenanceSchedule {
            initial_delay: Duration::MAX,
            interval: Duration::ZERO,
        }
        .clamped();
        assert_eq!(schedule.initial_delay, MAX_PERIOD);
        assert_eq!(schedule.interval, Duration::from_secs(1));
        assert_eq!(
            MaintenanceSchedule::default().clamped(),
            MaintenanceSchedule::default()
        );
    }

    #[tokio::test]
    async fn test_compacts_real_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("maint.db")).unwrap());
        db.exec("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('a'); DELETE FROM t;")
            .unwrap();

        let handle = start(
            &Handle::current(),
            db.clone(),
            MaintenanceSchedule {
                initial_delay: Duration::from_millis(10),
                interval: HOUR,
            },
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(10), async {
            while handle.stats().passes == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = handle.stats();
        assert_eq!(stats.failures, 0);
        assert!(stats.last_duration.is_some());
        assert!(db.integrity_check().unwrap());

        handle.shutdown().await;
    }
}
