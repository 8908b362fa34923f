//! Silent-stall watchdog: correlates upstream activity, queue flow and
//! commit freshness on a fixed cadence. A stall first triggers writer
//! recovery; consecutive failed recoveries force process exit with code 2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::hk_time::{now_ms, today_trading_day};
use crate::notify::{AlertEvent, Notifier, Severity};
use crate::persist::PersistQueue;
use crate::upstream::UpstreamStats;

pub const PERSIST_STALL_CODE: &str = "PERSIST_STALL";

/// Why the watchdog task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Supervisor requested shutdown.
    Stopped,
    /// Recovery failed too many times; the process must exit with code 2.
    Exit,
}

/// One sampled watchdog window, ages in seconds.
#[derive(Debug, Clone)]
pub struct WindowSample {
    pub upstream_active: bool,
    pub push_rows: u64,
    pub poll_fetched: u64,
    pub poll_accepted: u64,
    pub queue_in_rows: u64,
    pub persisted_rows: u64,
    pub queued_rows: usize,
    pub commit_age_sec: f64,
    pub dequeue_age_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    Healthy,
    /// Window whose only inflow was duplicate polls; never triggers.
    DuplicateOnly,
    Stall,
}

/// Pure stall classification over one window.
pub fn evaluate_stall(sample: &WindowSample, config: &WatchdogConfig) -> StallDecision {
    // Duplicate-only window: polls fetched rows but every one was already
    // known and there is no backlog to drain.
    if sample.poll_fetched > 0
        && sample.poll_accepted == 0
        && sample.push_rows == 0
        && sample.queued_rows == 0
    {
        return StallDecision::DuplicateOnly;
    }

    if !sample.upstream_active {
        return StallDecision::Healthy;
    }
    if sample.persisted_rows > 0 {
        return StallDecision::Healthy;
    }
    if sample.commit_age_sec < config.stall_sec as f64 {
        return StallDecision::Healthy;
    }
    if sample.queued_rows < config.queue_threshold_rows && sample.queue_in_rows == 0 {
        return StallDecision::Healthy;
    }
    // The consumer being mid-drain means progress, not a stall.
    if sample.dequeue_age_sec < config.stall_sec as f64 {
        return StallDecision::Healthy;
    }
    StallDecision::Stall
}

/// Tracks consecutive failed recoveries; `true` from `on_recovery_result`
/// means the escalation budget is spent and the process must exit.
#[derive(Debug)]
pub struct RecoveryPolicy {
    max_failures: u32,
    consecutive_failures: u32,
}

impl RecoveryPolicy {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures: max_failures.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn on_recovery_result(&mut self, recovered: bool) -> bool {
        if recovered {
            self.consecutive_failures = 0;
            false
        } else {
            self.consecutive_failures += 1;
            self.consecutive_failures >= self.max_failures
        }
    }

    pub fn on_healthy_window(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub struct Watchdog {
    config: WatchdogConfig,
    queue: Arc<PersistQueue>,
    stats: Arc<UpstreamStats>,
    notifier: Arc<Notifier>,
    stop: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        queue: Arc<PersistQueue>,
        stats: Arc<UpstreamStats>,
        notifier: Arc<Notifier>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            queue,
            stats,
            notifier,
            stop,
        }
    }

    pub async fn run(self) -> WatchdogOutcome {
        let interval = Duration::from_secs(self.config.interval_sec);
        let started = Instant::now();
        let mut policy = RecoveryPolicy::new(self.config.recovery_max_failures);
        let mut prev_counters = self.stats.counters();
        let mut prev_runtime = self.queue.snapshot_runtime_state();
        let mut stall_active = false;

        loop {
            tokio::time::sleep(interval).await;
            if self.stop.load(Ordering::SeqCst) {
                return WatchdogOutcome::Stopped;
            }

            let counters = self.stats.counters();
            let delta = counters.delta_since(&prev_counters);
            prev_counters = counters;

            let runtime = self.queue.snapshot_runtime_state();
            let persisted_rows = runtime.total_rows_committed - prev_runtime.total_rows_committed;
            let queue_in_rows = runtime.total_rows_enqueued - prev_runtime.total_rows_enqueued;
            prev_runtime = runtime;

            let upstream_recent = self
                .stats
                .upstream_active_age_sec()
                .is_some_and(|age| age <= self.config.upstream_window_sec as f64);
            let poll_active = delta.poll_fetched > 0 && delta.poll_seq_advanced > 0;
            let upstream_active = upstream_recent && (delta.push_rows > 0 || poll_active);

            let fallback_age = started.elapsed().as_secs_f64();
            let sample = WindowSample {
                upstream_active,
                push_rows: delta.push_rows,
                poll_fetched: delta.poll_fetched,
                poll_accepted: delta.poll_accepted,
                queue_in_rows,
                persisted_rows,
                queued_rows: self.queue.queued_rows(),
                commit_age_sec: self.queue.last_commit_age_sec().unwrap_or(fallback_age),
                dequeue_age_sec: self.queue.last_drain_age_sec().unwrap_or(fallback_age),
            };

            match evaluate_stall(&sample, &self.config) {
                StallDecision::Stall => {
                    error!(
                        upstream_active = sample.upstream_active,
                        persist_stall_sec = format_args!("{:.1}", sample.commit_age_sec),
                        queue = self.queue.queue_size(),
                        queue_maxsize = self.queue.queue_maxsize(),
                        push_rows = sample.push_rows,
                        poll_fetched = sample.poll_fetched,
                        poll_accepted = sample.poll_accepted,
                        queue_in_rows = sample.queue_in_rows,
                        queued_rows = sample.queued_rows,
                        max_seq_lag = self.stats.max_seq_lag(),
                        ts_drift_sec = self.stats.drift_sec().unwrap_or(0.0),
                        "WATCHDOG persistent_stall"
                    );
                    stall_active = true;
                    self.notifier.submit_alert(self.stall_event(&sample));

                    let recovered = self
                        .queue
                        .request_writer_recovery(
                            "watchdog_stall",
                            Duration::from_secs_f64(self.config.recovery_join_timeout_sec),
                        )
                        .await;
                    if policy.on_recovery_result(recovered) {
                        error!(
                            consecutive_failures = policy.consecutive_failures(),
                            max_failures = self.config.recovery_max_failures,
                            "watchdog_recovery_exhausted forcing_exit"
                        );
                        return WatchdogOutcome::Exit;
                    }
                    if !recovered {
                        warn!(
                            consecutive_failures = policy.consecutive_failures(),
                            "watchdog_recovery_failed"
                        );
                    }
                }
                StallDecision::DuplicateOnly => {
                    info!(
                        poll_fetched = sample.poll_fetched,
                        poll_accepted = sample.poll_accepted,
                        "watchdog_window_duplicate_only"
                    );
                    policy.on_healthy_window();
                }
                StallDecision::Healthy => {
                    if stall_active && sample.persisted_rows > 0 {
                        stall_active = false;
                        self.notifier.resolve_alert(
                            PERSIST_STALL_CODE,
                            &today_trading_day(),
                            None,
                            vec![format!(
                                "persisted_rows_in_window={}",
                                sample.persisted_rows
                            )],
                        );
                    }
                    policy.on_healthy_window();
                }
            }
        }
    }

    fn stall_event(&self, sample: &WindowSample) -> AlertEvent {
        let trading_day = today_trading_day();
        AlertEvent {
            created_at_ms: now_ms(),
            code: PERSIST_STALL_CODE.to_string(),
            severity: Severity::Alert,
            trading_day: trading_day.clone(),
            summary_lines: vec![
                format!("persist_stall_sec={:.1}", sample.commit_age_sec),
                format!(
                    "queue={}/{} queued_rows={}",
                    self.queue.queue_size(),
                    self.queue.queue_maxsize(),
                    sample.queued_rows
                ),
                format!(
                    "push_rows={} poll_fetched={} poll_accepted={}",
                    sample.push_rows, sample.poll_fetched, sample.poll_accepted
                ),
                format!("max_seq_lag={}", self.stats.max_seq_lag()),
            ],
            suggestions: vec![
                "journalctl -u hktick-collector -n 120 --no-pager".to_string(),
                "check disk space and WAL size under the data root".to_string(),
            ],
            headline: None,
            impact: None,
            fingerprint: Some(format!("{PERSIST_STALL_CODE}:{trading_day}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            stall_sec: 180,
            upstream_window_sec: 60,
            queue_threshold_rows: 1,
            recovery_max_failures: 2,
            recovery_join_timeout_sec: 3.0,
            interval_sec: 60,
        }
    }

    fn stalled_sample() -> WindowSample {
        WindowSample {
            upstream_active: true,
            push_rows: 10,
            poll_fetched: 0,
            poll_accepted: 0,
            queue_in_rows: 10,
            persisted_rows: 0,
            queued_rows: 10,
            commit_age_sec: 200.0,
            dequeue_age_sec: 200.0,
        }
    }

    #[test]
    fn full_stall_is_detected() {
        assert_eq!(evaluate_stall(&stalled_sample(), &config()), StallDecision::Stall);
    }

    #[test]
    fn each_missing_condition_suppresses_stall() {
        let cfg = config();

        let mut s = stalled_sample();
        s.upstream_active = false;
        assert_eq!(evaluate_stall(&s, &cfg), StallDecision::Healthy);

        let mut s = stalled_sample();
        s.persisted_rows = 5;
        assert_eq!(evaluate_stall(&s, &cfg), StallDecision::Healthy);

        let mut s = stalled_sample();
        s.commit_age_sec = 10.0;
        assert_eq!(evaluate_stall(&s, &cfg), StallDecision::Healthy);

        let mut s = stalled_sample();
        s.queued_rows = 0;
        s.queue_in_rows = 0;
        assert_eq!(evaluate_stall(&s, &cfg), StallDecision::Healthy);

        // Consumer actively draining: dequeue age below threshold.
        let mut s = stalled_sample();
        s.dequeue_age_sec = 5.0;
        assert_eq!(evaluate_stall(&s, &cfg), StallDecision::Healthy);
    }

    #[test]
    fn duplicate_only_window_never_triggers() {
        let cfg = config();
        let sample = WindowSample {
            upstream_active: true,
            push_rows: 0,
            poll_fetched: 50,
            poll_accepted: 0,
            queue_in_rows: 0,
            persisted_rows: 0,
            queued_rows: 0,
            commit_age_sec: 10_000.0,
            dequeue_age_sec: 10_000.0,
        };
        assert_eq!(evaluate_stall(&sample, &cfg), StallDecision::DuplicateOnly);
    }

    #[test]
    fn inflow_with_empty_queue_still_counts() {
        // Rows flowed in during the window and vanished without commits.
        let cfg = config();
        let mut sample = stalled_sample();
        sample.queued_rows = 0;
        sample.queue_in_rows = 7;
        assert_eq!(evaluate_stall(&sample, &cfg), StallDecision::Stall);
    }

    #[test]
    fn recovery_policy_escalates_after_consecutive_failures() {
        let mut policy = RecoveryPolicy::new(2);
        assert!(!policy.on_recovery_result(false));
        assert_eq!(policy.consecutive_failures(), 1);
        // A successful recovery resets the budget.
        assert!(!policy.on_recovery_result(true));
        assert_eq!(policy.consecutive_failures(), 0);

        assert!(!policy.on_recovery_result(false));
        assert!(policy.on_recovery_result(false));
    }

    #[test]
    fn healthy_window_resets_failure_budget() {
        let mut policy = RecoveryPolicy::new(2);
        assert!(!policy.on_recovery_result(false));
        policy.on_healthy_window();
        assert!(!policy.on_recovery_result(false));
        assert!(policy.on_recovery_result(false));
    }
}
