//! Bounded backpressured persistence queue. Producers enqueue row batches
//! from any task; a single worker generation drains them into the store.
//! Recovery tears down the current generation and spawns a replacement that
//! first consumes the carryover buffer, so restart never loses rows.

pub mod latency;
mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::calendar::SessionCalendar;
use crate::config::{QualityConfig, QueueConfig};
use crate::db::{PersistResult, TickStore};
use crate::error::{AppError, Result};
use crate::quality::QualityReport;
use crate::types::TickRow;

pub use latency::CommitLatencyStats;

/// Invoked on the observer dispatch task after each successful commit, in
/// commit order, with the row batch and its result.
pub type PersistObserver = Arc<dyn Fn(&[TickRow], &PersistResult) + Send + Sync>;

/// Since-last-report pipeline counters; `snapshot(reset=true)` zeroes them.
#[derive(Debug, Default, Clone)]
pub struct PipelineCounters {
    pub persisted_rows: u64,
    pub ignored_rows: u64,
    pub queue_in_rows: u64,
    pub queue_out_rows: u64,
    pub db_commits: u64,
}

/// Copy of worker runtime state with ages derived at snapshot time.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub worker_alive: bool,
    pub last_drain_age_sec: Option<f64>,
    pub last_commit_age_sec: Option<f64>,
    pub last_commit_rows: u64,
    pub last_exception_type: String,
    pub last_exception_count: u64,
    pub last_backoff_sec: f64,
    pub busy_locked_count: u64,
    pub busy_backoff_count: u64,
    pub recovery_count: u64,
    pub last_recovery_age_sec: Option<f64>,
    pub total_rows_enqueued: u64,
    pub total_rows_dequeued: u64,
    pub total_rows_committed: u64,
    pub total_commits: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    counters: PipelineCounters,
    worker_alive: bool,
    last_drain_at: Option<Instant>,
    last_commit_at: Option<Instant>,
    last_commit_rows: u64,
    last_exception_type: Option<String>,
    last_exception_count: u64,
    last_backoff_sec: f64,
    busy_locked_count: u64,
    busy_backoff_count: u64,
    recovery_count: u64,
    last_recovery_at: Option<Instant>,
    total_rows_enqueued: u64,
    total_rows_dequeued: u64,
    total_rows_committed: u64,
    total_commits: u64,
}

fn age_sec(instant: Option<Instant>) -> Option<f64> {
    instant.map(|at| at.elapsed().as_secs_f64())
}

pub struct PersistQueue {
    config: QueueConfig,
    store: TickStore,
    quality: QualityConfig,
    session_calendar: SessionCalendar,
    report: Arc<QualityReport>,

    tx: mpsc::Sender<Vec<TickRow>>,
    rx: AsyncMutex<mpsc::Receiver<Vec<TickRow>>>,
    /// Rows in the channel plus the carryover buffer, not yet drained.
    queued_rows: AtomicUsize,
    carryover: Mutex<VecDeque<TickRow>>,

    state: Mutex<QueueState>,
    pub commit_latency: CommitLatencyStats,

    stop: AtomicBool,
    generation: AtomicU64,
    restart_signal: Mutex<Option<Arc<AtomicBool>>>,
    worker_handle: AsyncMutex<Option<JoinHandle<()>>>,
    heartbeat_handle: AsyncMutex<Option<JoinHandle<()>>>,

    observer: Mutex<Option<PersistObserver>>,
    observer_tx: Mutex<Option<mpsc::UnboundedSender<(Vec<TickRow>, PersistResult)>>>,
    observer_handle: AsyncMutex<Option<JoinHandle<()>>>,

    fatal: AtomicBool,
    fatal_notify: Notify,
}

impl PersistQueue {
    pub fn new(
        config: QueueConfig,
        store: TickStore,
        quality: QualityConfig,
        session_calendar: SessionCalendar,
        report: Arc<QualityReport>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_queue_size);
        Arc::new(Self {
            config,
            store,
            quality,
            session_calendar,
            report,
            tx,
            rx: AsyncMutex::new(rx),
            queued_rows: AtomicUsize::new(0),
            carryover: Mutex::new(VecDeque::new()),
            state: Mutex::new(QueueState::default()),
            commit_latency: CommitLatencyStats::new(),
            stop: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            restart_signal: Mutex::new(None),
            worker_handle: AsyncMutex::new(None),
            heartbeat_handle: AsyncMutex::new(None),
            observer: Mutex::new(None),
            observer_tx: Mutex::new(None),
            observer_handle: AsyncMutex::new(None),
            fatal: AtomicBool::new(false),
            fatal_notify: Notify::new(),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let mut handle_guard = self.worker_handle.lock().await;
        if handle_guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        self.fatal.store(false, Ordering::SeqCst);

        // Observer dispatch task: the single boundary through which commit
        // results reach the client, preserving commit order.
        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel::<(Vec<TickRow>, PersistResult)>();
        if let Ok(mut slot) = self.observer_tx.lock() {
            *slot = Some(obs_tx);
        }
        let queue_ref = Arc::clone(self);
        *self.observer_handle.lock().await = Some(tokio::spawn(async move {
            while let Some((rows, result)) = obs_rx.recv().await {
                let callback = queue_ref.observer.lock().ok().and_then(|slot| slot.clone());
                if let Some(callback) = callback {
                    callback(&rows, &result);
                }
            }
        }));

        self.spawn_worker_locked(&mut handle_guard, "startup");
        drop(handle_guard);

        let heartbeat = Arc::clone(self);
        *self.heartbeat_handle.lock().await =
            Some(tokio::spawn(async move { heartbeat.heartbeat_loop().await }));
    }

    /// Graceful stop: the worker drains its buffer and the channel before
    /// exiting. On join timeout, uncommitted rows are never discarded — the
    /// worker keeps flushing; `cancel_on_timeout` aborts it anyway.
    pub async fn stop(&self, timeout: Duration, cancel_on_timeout: bool) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);

        let handle = self.worker_handle.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                error!(
                    timeout_sec = timeout.as_secs_f64(),
                    queue = self.queue_size(),
                    queue_maxsize = self.queue_maxsize(),
                    cancel_on_timeout,
                    "collector_stop_timeout"
                );
                if cancel_on_timeout {
                    handle.abort();
                    let _ = handle.await;
                } else {
                    return Err(AppError::Shutdown(
                        "persist worker did not stop within timeout".to_string(),
                    ));
                }
            }
        }

        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        if let Ok(mut slot) = self.observer_tx.lock() {
            *slot = None;
        }
        if let Some(handle) = self.observer_handle.lock().await.take() {
            let _ = handle.await;
        }

        if self.fatal.load(Ordering::SeqCst) {
            return Err(AppError::Shutdown(
                "persist worker terminated with fatal error".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_persist_observer(&self, observer: Option<PersistObserver>) {
        if let Ok(mut slot) = self.observer.lock() {
            *slot = observer;
        }
    }

    /// Non-blocking enqueue. Drops the whole batch when the queue is full;
    /// the caller accounts the drop.
    pub fn enqueue(&self, rows: Vec<TickRow>) -> bool {
        if rows.is_empty() {
            return false;
        }
        let count = rows.len();
        match self.tx.try_send(rows) {
            Ok(()) => {
                self.queued_rows.fetch_add(count, Ordering::Relaxed);
                if let Ok(mut state) = self.state.lock() {
                    state.counters.queue_in_rows += count as u64;
                    state.total_rows_enqueued += count as u64;
                }
                true
            }
            Err(_) => {
                warn!(rows = count, "queue full, dropping batch");
                false
            }
        }
    }

    /// Batches currently buffered in the channel.
    pub fn queue_size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn queue_maxsize(&self) -> usize {
        self.config.max_queue_size
    }

    /// Rows not yet drained by the worker (channel + carryover).
    pub fn queued_rows(&self) -> usize {
        self.queued_rows.load(Ordering::Relaxed)
    }

    pub fn snapshot_pipeline_counters(&self, reset: bool) -> PipelineCounters {
        let Ok(mut state) = self.state.lock() else {
            return PipelineCounters::default();
        };
        let counters = state.counters.clone();
        if reset {
            state.counters = PipelineCounters::default();
        }
        counters
    }

    pub fn snapshot_runtime_state(&self) -> RuntimeState {
        let Ok(state) = self.state.lock() else {
            return RuntimeState {
                worker_alive: false,
                last_drain_age_sec: None,
                last_commit_age_sec: None,
                last_commit_rows: 0,
                last_exception_type: "none".to_string(),
                last_exception_count: 0,
                last_backoff_sec: 0.0,
                busy_locked_count: 0,
                busy_backoff_count: 0,
                recovery_count: 0,
                last_recovery_age_sec: None,
                total_rows_enqueued: 0,
                total_rows_dequeued: 0,
                total_rows_committed: 0,
                total_commits: 0,
            };
        };
        RuntimeState {
            worker_alive: state.worker_alive,
            last_drain_age_sec: age_sec(state.last_drain_at),
            last_commit_age_sec: age_sec(state.last_commit_at),
            last_commit_rows: state.last_commit_rows,
            last_exception_type: state
                .last_exception_type
                .clone()
                .unwrap_or_else(|| "none".to_string()),
            last_exception_count: state.last_exception_count,
            last_backoff_sec: state.last_backoff_sec,
            busy_locked_count: state.busy_locked_count,
            busy_backoff_count: state.busy_backoff_count,
            recovery_count: state.recovery_count,
            last_recovery_age_sec: age_sec(state.last_recovery_at),
            total_rows_enqueued: state.total_rows_enqueued,
            total_rows_dequeued: state.total_rows_dequeued,
            total_rows_committed: state.total_rows_committed,
            total_commits: state.total_commits,
        }
    }

    /// Seconds since the last successful commit, if any.
    pub fn last_commit_age_sec(&self) -> Option<f64> {
        self.state.lock().ok().and_then(|s| age_sec(s.last_commit_at))
    }

    /// Seconds since the worker last pulled from the channel, if ever.
    pub fn last_drain_age_sec(&self) -> Option<f64> {
        self.state.lock().ok().and_then(|s| age_sec(s.last_drain_at))
    }

    /// Tear down the current worker generation and spawn a replacement with
    /// a fresh writer. Returns false when the old generation refuses to exit
    /// within `join_timeout` (the caller escalates).
    pub async fn request_writer_recovery(
        self: &Arc<Self>,
        reason: &str,
        join_timeout: Duration,
    ) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }

        let mut handle_guard = self.worker_handle.lock().await;
        if let Some(handle) = handle_guard.as_mut() {
            if !handle.is_finished() {
                warn!(
                    reason,
                    queue = self.queue_size(),
                    queue_maxsize = self.queue_maxsize(),
                    generation = self.generation.load(Ordering::SeqCst),
                    "persist_recovery_request"
                );
                if let Some(signal) = self.restart_signal.lock().ok().and_then(|s| s.clone()) {
                    signal.store(true, Ordering::SeqCst);
                }
                if tokio::time::timeout(join_timeout, &mut *handle).await.is_err() {
                    error!(
                        reason,
                        queue = self.queue_size(),
                        queue_maxsize = self.queue_maxsize(),
                        generation = self.generation.load(Ordering::SeqCst),
                        "persist_recovery_failed"
                    );
                    return false;
                }
            }
        }
        *handle_guard = None;

        self.fatal.store(false, Ordering::SeqCst);
        self.spawn_worker_locked(&mut handle_guard, &format!("recovery:{reason}"));
        if let Ok(mut state) = self.state.lock() {
            state.recovery_count += 1;
            state.last_recovery_at = Some(Instant::now());
        }
        warn!(
            reason,
            queue = self.queue_size(),
            queue_maxsize = self.queue_maxsize(),
            generation = self.generation.load(Ordering::SeqCst),
            "persist_recovery_success"
        );
        true
    }

    pub fn fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Resolves when the worker records a fatal condition.
    pub async fn wait_fatal(&self) {
        loop {
            let notified = self.fatal_notify.notified();
            if self.fatal.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn spawn_worker_locked(self: &Arc<Self>, guard: &mut Option<JoinHandle<()>>, reason: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let restart = Arc::new(AtomicBool::new(false));
        if let Ok(mut slot) = self.restart_signal.lock() {
            *slot = Some(Arc::clone(&restart));
        }
        let queue = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            worker::worker_loop(queue, restart, generation).await;
        }));
        info!(
            reason,
            generation,
            queue = self.queue_size(),
            queue_maxsize = self.queue_maxsize(),
            "persist_worker_started"
        );
    }

    fn take_carryover(&self) -> Vec<TickRow> {
        let Ok(mut carryover) = self.carryover.lock() else {
            return Vec::new();
        };
        let rows: Vec<TickRow> = carryover.drain(..).collect();
        if !rows.is_empty() {
            self.queued_rows.fetch_sub(rows.len(), Ordering::Relaxed);
        }
        rows
    }

    fn push_carryover(&self, rows: Vec<TickRow>) {
        if rows.is_empty() {
            return;
        }
        let count = rows.len();
        if let Ok(mut carryover) = self.carryover.lock() {
            warn!(
                rows = count,
                queue = self.queue_size(),
                queue_maxsize = self.queue_maxsize(),
                "persist_requeue_rows"
            );
            carryover.extend(rows);
            self.queued_rows.fetch_add(count, Ordering::Relaxed);
        }
    }

    fn send_to_observer(&self, rows: Vec<TickRow>, result: PersistResult) {
        let sender = self.observer_tx.lock().ok().and_then(|s| s.clone());
        if let Some(sender) = sender {
            let _ = sender.send((rows, result));
        }
    }

    fn signal_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.fatal_notify.notify_waiters();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_sec);
        let mut prev_dequeued = 0u64;
        let mut prev_committed = 0u64;
        let mut prev_at = Instant::now();

        loop {
            let runtime = self.snapshot_runtime_state();
            if self.stop.load(Ordering::SeqCst) && !runtime.worker_alive {
                return;
            }
            tokio::time::sleep(interval).await;

            let now = Instant::now();
            let runtime = self.snapshot_runtime_state();
            let elapsed = (now - prev_at).as_secs_f64().max(0.001);
            let drain_rate = (runtime.total_rows_dequeued - prev_dequeued) as f64 / elapsed;
            let commit_rate = (runtime.total_rows_committed - prev_committed) as f64 / elapsed;
            let (p50, p95, p99) = self.commit_latency.percentiles();

            info!(
                worker_alive = runtime.worker_alive,
                queue = self.queue_size(),
                queue_maxsize = self.queue_maxsize(),
                drain_rate_rows_per_sec = format_args!("{drain_rate:.2}"),
                commit_rate_rows_per_sec = format_args!("{commit_rate:.2}"),
                last_drain_age_sec = runtime.last_drain_age_sec.unwrap_or(-1.0),
                last_commit_age_sec = runtime.last_commit_age_sec.unwrap_or(-1.0),
                last_exception_type = %runtime.last_exception_type,
                last_exception_count = runtime.last_exception_count,
                busy_locked_count = runtime.busy_locked_count,
                busy_backoff_count = runtime.busy_backoff_count,
                last_backoff_sec = format_args!("{:.3}", runtime.last_backoff_sec),
                last_commit_rows = runtime.last_commit_rows,
                commit_p50_ms = p50.unwrap_or(0),
                commit_p95_ms = p95.unwrap_or(0),
                commit_p99_ms = p99.unwrap_or(0),
                wal_bytes = self.store.wal_size_bytes(),
                recovery_count = runtime.recovery_count,
                "persist_loop_heartbeat"
            );

            for day in self.report.take_dirty_days() {
                if let Err(err) = self.report.write_file(&day) {
                    warn!(trading_day = %day, error = %err, "quality_report_write_failed");
                }
            }

            prev_dequeued = runtime.total_rows_dequeued;
            prev_committed = runtime.total_rows_committed;
            prev_at = now;
        }
    }
}
