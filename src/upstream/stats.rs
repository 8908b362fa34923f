//! Shared upstream client state: connection gauge, cumulative flow counters,
//! and per-symbol dedupe baselines. The client mutates on its dispatch task;
//! the watchdog, notifier and health endpoint read concurrently.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use crate::hk_time::now_ms;
use crate::types::TickRow;

/// Upstream connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Subscribed = 2,
    Backfilling = 3,
    Running = 4,
    Reconnecting = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Subscribed,
            3 => ConnectionState::Backfilling,
            4 => ConnectionState::Running,
            5 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Backfilling => "backfilling",
            ConnectionState::Running => "running",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-symbol baselines and freshness stamps. Sequence baselines are monotone
/// non-decreasing; -1 means never seen. Time stamps are milliseconds since
/// the stats epoch; 0 means never.
#[derive(Debug)]
pub struct SymbolTracker {
    pub last_seen_seq: AtomicI64,
    pub last_accepted_seq: AtomicI64,
    pub last_persisted_seq: AtomicI64,
    pub last_tick_seen_rel_ms: AtomicU64,
    pub last_push_rel_ms: AtomicU64,
}

impl Default for SymbolTracker {
    fn default() -> Self {
        Self {
            last_seen_seq: AtomicI64::new(-1),
            last_accepted_seq: AtomicI64::new(-1),
            last_persisted_seq: AtomicI64::new(-1),
            last_tick_seen_rel_ms: AtomicU64::new(0),
            last_push_rel_ms: AtomicU64::new(0),
        }
    }
}

fn load_seq(value: &AtomicI64) -> Option<i64> {
    let seq = value.load(Ordering::Relaxed);
    (seq >= 0).then_some(seq)
}

/// Copy of the cumulative flow counters; readers diff consecutive snapshots
/// to obtain per-window rates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamCounters {
    pub push_rows: u64,
    pub poll_fetched: u64,
    pub poll_accepted: u64,
    pub poll_enqueued: u64,
    pub poll_seq_advanced: u64,
    pub dropped_queue_full: u64,
    pub dropped_duplicate: u64,
    pub dropped_filter: u64,
}

impl UpstreamCounters {
    pub fn delta_since(&self, prev: &UpstreamCounters) -> UpstreamCounters {
        UpstreamCounters {
            push_rows: self.push_rows - prev.push_rows,
            poll_fetched: self.poll_fetched - prev.poll_fetched,
            poll_accepted: self.poll_accepted - prev.poll_accepted,
            poll_enqueued: self.poll_enqueued - prev.poll_enqueued,
            poll_seq_advanced: self.poll_seq_advanced - prev.poll_seq_advanced,
            dropped_queue_full: self.dropped_queue_full - prev.dropped_queue_full,
            dropped_duplicate: self.dropped_duplicate - prev.dropped_duplicate,
            dropped_filter: self.dropped_filter - prev.dropped_filter,
        }
    }
}

pub struct UpstreamStats {
    epoch: Instant,
    started_at_ms: i64,
    state: AtomicU8,
    connected: AtomicBool,
    last_upstream_active_rel_ms: AtomicU64,
    /// Maximum tick `ts_ms` observed; 0 = none yet.
    max_ts_ms_seen: AtomicI64,

    push_rows: AtomicU64,
    poll_fetched: AtomicU64,
    poll_accepted: AtomicU64,
    poll_enqueued: AtomicU64,
    poll_seq_advanced: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_filter: AtomicU64,

    symbols: DashMap<String, SymbolTracker>,
    last_poll_fetched_seq: DashMap<String, i64>,
}

impl UpstreamStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            started_at_ms: now_ms(),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            connected: AtomicBool::new(false),
            last_upstream_active_rel_ms: AtomicU64::new(0),
            max_ts_ms_seen: AtomicI64::new(0),
            push_rows: AtomicU64::new(0),
            poll_fetched: AtomicU64::new(0),
            poll_accepted: AtomicU64::new(0),
            poll_enqueued: AtomicU64::new(0),
            poll_seq_advanced: AtomicU64::new(0),
            dropped_queue_full: AtomicU64::new(0),
            dropped_duplicate: AtomicU64::new(0),
            dropped_filter: AtomicU64::new(0),
            symbols: DashMap::new(),
            last_poll_fetched_seq: DashMap::new(),
        }
    }

    fn rel_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn uptime_sec(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    // -- connection state ---------------------------------------------------

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
        self.connected.store(
            matches!(
                state,
                ConnectionState::Subscribed | ConnectionState::Backfilling | ConnectionState::Running
            ),
            Ordering::Relaxed,
        );
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    // -- flow counters ------------------------------------------------------

    pub fn add_push_rows(&self, count: u64) {
        self.push_rows.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_poll_fetched(&self, count: u64) {
        self.poll_fetched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_poll_accepted(&self, count: u64) {
        self.poll_accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_poll_enqueued(&self, count: u64) {
        self.poll_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dropped_queue_full(&self, count: u64) {
        self.dropped_queue_full.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dropped_duplicate(&self, count: u64) {
        self.dropped_duplicate.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dropped_filter(&self, count: u64) {
        self.dropped_filter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn counters(&self) -> UpstreamCounters {
        UpstreamCounters {
            push_rows: self.push_rows.load(Ordering::Relaxed),
            poll_fetched: self.poll_fetched.load(Ordering::Relaxed),
            poll_accepted: self.poll_accepted.load(Ordering::Relaxed),
            poll_enqueued: self.poll_enqueued.load(Ordering::Relaxed),
            poll_seq_advanced: self.poll_seq_advanced.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_filter: self.dropped_filter.load(Ordering::Relaxed),
        }
    }

    // -- upstream activity / freshness --------------------------------------

    pub fn mark_upstream_active(&self) {
        self.last_upstream_active_rel_ms
            .store(self.rel_ms().max(1), Ordering::Relaxed);
    }

    pub fn upstream_active_age_sec(&self) -> Option<f64> {
        let at = self.last_upstream_active_rel_ms.load(Ordering::Relaxed);
        (at > 0).then(|| (self.rel_ms().saturating_sub(at)) as f64 / 1000.0)
    }

    pub fn max_ts_ms_seen(&self) -> Option<i64> {
        let ts = self.max_ts_ms_seen.load(Ordering::Relaxed);
        (ts > 0).then_some(ts)
    }

    /// `now - max(ts_ms)` in seconds; positive when ticks lag the clock.
    pub fn drift_sec(&self) -> Option<f64> {
        self.max_ts_ms_seen()
            .map(|ts| (now_ms() - ts) as f64 / 1000.0)
    }

    // -- per-symbol baselines -----------------------------------------------

    /// Record rows observed from upstream (any source) before filtering.
    pub fn record_seen_rows(&self, rows: &[TickRow], is_push: bool) {
        if rows.is_empty() {
            return;
        }
        let rel_now = self.rel_ms().max(1);
        self.last_upstream_active_rel_ms
            .store(rel_now, Ordering::Relaxed);

        for row in rows {
            let tracker = self.symbols.entry(row.symbol.clone()).or_default();
            tracker.last_tick_seen_rel_ms.store(rel_now, Ordering::Relaxed);
            if is_push {
                tracker.last_push_rel_ms.store(rel_now, Ordering::Relaxed);
            }
            if let Some(seq) = row.seq {
                tracker.last_seen_seq.fetch_max(seq, Ordering::Relaxed);
            }
            self.max_ts_ms_seen.fetch_max(row.ts_ms, Ordering::Relaxed);
        }
    }

    pub fn record_accepted_seq(&self, symbol: &str, seq: i64) {
        self.symbols
            .entry(symbol.to_string())
            .or_default()
            .last_accepted_seq
            .fetch_max(seq, Ordering::Relaxed);
    }

    /// Persist-observer callback body: advance `last_persisted_seq` from a
    /// committed batch. Monotone by construction.
    pub fn record_persist_result(&self, rows: &[TickRow]) {
        for row in rows {
            if let Some(seq) = row.seq {
                self.symbols
                    .entry(row.symbol.clone())
                    .or_default()
                    .last_persisted_seq
                    .fetch_max(seq, Ordering::Relaxed);
            }
        }
    }

    /// Seed `last_accepted_seq`/`last_persisted_seq` from recent shards so a
    /// restart immediately suppresses already-persisted rows.
    pub fn seed_persisted_seq(&self, seed: &std::collections::HashMap<String, i64>) {
        for (symbol, seq) in seed {
            let tracker = self.symbols.entry(symbol.clone()).or_default();
            tracker.last_accepted_seq.fetch_max(*seq, Ordering::Relaxed);
            tracker.last_persisted_seq.fetch_max(*seq, Ordering::Relaxed);
        }
    }

    /// Poll dedupe baseline: `max(last_accepted_seq, last_persisted_seq)`.
    pub fn dedupe_baseline_seq(&self, symbol: &str) -> Option<i64> {
        let tracker = self.symbols.get(symbol)?;
        let accepted = load_seq(&tracker.last_accepted_seq);
        let persisted = load_seq(&tracker.last_persisted_seq);
        match (accepted, persisted) {
            (Some(a), Some(p)) => Some(a.max(p)),
            (Some(a), None) => Some(a),
            (None, Some(p)) => Some(p),
            (None, None) => None,
        }
    }

    pub fn last_seen_seq(&self, symbol: &str) -> Option<i64> {
        self.symbols
            .get(symbol)
            .and_then(|t| load_seq(&t.last_seen_seq))
    }

    pub fn last_accepted_seq(&self, symbol: &str) -> Option<i64> {
        self.symbols
            .get(symbol)
            .and_then(|t| load_seq(&t.last_accepted_seq))
    }

    pub fn last_persisted_seq(&self, symbol: &str) -> Option<i64> {
        self.symbols
            .get(symbol)
            .and_then(|t| load_seq(&t.last_persisted_seq))
    }

    pub fn last_tick_age_sec(&self, symbol: &str) -> Option<f64> {
        let tracker = self.symbols.get(symbol)?;
        let at = tracker.last_tick_seen_rel_ms.load(Ordering::Relaxed);
        (at > 0).then(|| (self.rel_ms().saturating_sub(at)) as f64 / 1000.0)
    }

    pub fn last_push_age_sec(&self, symbol: &str) -> Option<f64> {
        let tracker = self.symbols.get(symbol)?;
        let at = tracker.last_push_rel_ms.load(Ordering::Relaxed);
        (at > 0).then(|| (self.rel_ms().saturating_sub(at)) as f64 / 1000.0)
    }

    /// Record the newest seq a poll cycle fetched; counts as upstream
    /// activity only when it advances.
    pub fn record_poll_seq_advance(&self, symbol: &str, fetched_last_seq: Option<i64>) {
        let Some(fetched) = fetched_last_seq else {
            return;
        };
        let advanced = match self.last_poll_fetched_seq.entry(symbol.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if fetched > *entry.get() {
                    entry.insert(fetched);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(fetched);
                true
            }
        };
        if advanced {
            self.poll_seq_advanced.fetch_add(1, Ordering::Relaxed);
            self.mark_upstream_active();
        }
    }

    /// Largest `last_seen_seq - last_persisted_seq` across symbols.
    pub fn max_seq_lag(&self) -> i64 {
        let mut max_lag = 0i64;
        for entry in self.symbols.iter() {
            let Some(seen) = load_seq(&entry.last_seen_seq) else {
                continue;
            };
            let persisted = load_seq(&entry.last_persisted_seq).unwrap_or(0);
            max_lag = max_lag.max(seen - persisted);
        }
        max_lag
    }
}

impl Default for UpstreamStats {
    fn default() -> Self {
        Self::new()
    }
}
