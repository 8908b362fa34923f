//! Upstream client: reconnect supervisor, push stream handling, per-symbol
//! polling fallback with dedupe baselines, and the periodic health line.
//!
//! Push frames arrive on the WS reader task; the bounded handoff channel is
//! the only boundary into the dispatch task, which owns all mutable dedupe
//! state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{
    PollConfig, UpstreamConfig, HANDOFF_CHANNEL_CAPACITY, HEALTH_LOG_INTERVAL_SEC,
    POLL_RECENT_KEY_LIMIT,
};
use crate::db::TickStore;
use crate::error::{AppError, Result};
use crate::hk_time::{format_ts_ms_utc, now_ms, today_trading_day};
use crate::notify::{AlertEvent, HealthSnapshot, Notifier, Severity, SymbolSnapshot};
use crate::persist::PersistQueue;
use crate::types::{CompositeKey, PushType, TickRow};
use crate::upstream::messages::{build_subscribe_msg, parse_gateway_frame, GatewayFrame, RawTick};
use crate::upstream::normalize::raw_ticks_to_rows;
use crate::upstream::stats::{ConnectionState, UpstreamCounters, UpstreamStats};

const DISCONNECT_CODE: &str = "DISCONNECT";
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// ---------------------------------------------------------------------------
// Stop handle
// ---------------------------------------------------------------------------

/// Shared stop switch: the supervisor flips it, every client loop observes
/// it at its next suspension point.
pub struct ClientHandle {
    stop: AtomicBool,
    notify: Notify,
}

impl ClientHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential backoff clamped to `[min, max]` seconds, with sub-second
/// jitter so restarting collectors do not stampede the gateway.
struct ExponentialBackoff {
    min: f64,
    max: f64,
    current: f64,
}

impl ExponentialBackoff {
    fn new(min_delay: u64, max_delay: u64) -> Self {
        let min = (min_delay.max(1)) as f64;
        let max = (max_delay as f64).max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn next_delay(&mut self) -> f64 {
        let delay = self.current;
        self.current = (self.current * 2.0).min(self.max);
        (delay + rand::thread_rng().gen_range(0.0..1.0)).max(self.min)
    }
}

// ---------------------------------------------------------------------------
// Poll dedupe state for rows without a sequence number
// ---------------------------------------------------------------------------

/// Bounded recent-key memory with FIFO eviction.
#[derive(Debug, Default)]
pub(crate) struct RecentKeySet {
    order: VecDeque<CompositeKey>,
    keys: HashSet<CompositeKey>,
}

impl RecentKeySet {
    fn contains(&self, key: &CompositeKey) -> bool {
        self.keys.contains(key)
    }

    fn remember(&mut self, key: CompositeKey) {
        if !self.keys.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > POLL_RECENT_KEY_LIMIT {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }
}

/// Drop polled rows already known to the pipeline: wrong-symbol rows, seqs
/// at or below `max(last_accepted_seq, last_persisted_seq)`, duplicate seqs
/// within the batch, and recently-seen composite keys for seq-less rows.
pub(crate) fn filter_polled_rows(
    stats: &UpstreamStats,
    recent: &RecentKeySet,
    symbol: &str,
    rows: Vec<TickRow>,
) -> (Vec<TickRow>, u64, u64) {
    if rows.is_empty() {
        return (Vec::new(), 0, 0);
    }

    let baseline_seq = stats.dedupe_baseline_seq(symbol);
    let mut seen_seq = HashSet::new();
    let mut seen_keys = HashSet::new();
    let mut new_rows = Vec::new();
    let mut dropped_duplicate = 0u64;
    let mut dropped_filter = 0u64;

    for row in rows {
        if row.symbol != symbol {
            dropped_filter += 1;
            continue;
        }

        match row.seq {
            None => {
                let key = row.composite_key();
                if recent.contains(&key) || !seen_keys.insert(key) {
                    dropped_duplicate += 1;
                    continue;
                }
                new_rows.push(row);
            }
            Some(seq) => {
                if !seen_seq.insert(seq) {
                    dropped_duplicate += 1;
                    continue;
                }
                if baseline_seq.is_some_and(|baseline| seq <= baseline) {
                    dropped_duplicate += 1;
                    continue;
                }
                new_rows.push(row);
            }
        }
    }

    (new_rows, dropped_duplicate, dropped_filter)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct UpstreamClient {
    upstream: UpstreamConfig,
    poll: PollConfig,
    drift_warn_sec: u64,
    store: TickStore,
    queue: Arc<PersistQueue>,
    stats: Arc<UpstreamStats>,
    notifier: Arc<Notifier>,
    handle: Arc<ClientHandle>,
    http: reqwest::Client,
    recent_keys: HashMap<String, RecentKeySet>,
    prev_health_counters: UpstreamCounters,
}

impl UpstreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: UpstreamConfig,
        poll: PollConfig,
        drift_warn_sec: u64,
        store: TickStore,
        queue: Arc<PersistQueue>,
        stats: Arc<UpstreamStats>,
        notifier: Arc<Notifier>,
        handle: Arc<ClientHandle>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            upstream,
            poll,
            drift_warn_sec,
            store,
            queue,
            stats,
            notifier,
            handle,
            http,
            recent_keys: HashMap::new(),
            prev_health_counters: UpstreamCounters::default(),
        }
    }

    /// Reconnect supervisor: connect, subscribe, optionally backfill, then
    /// drive the dispatch loop until the connection or the process dies.
    pub async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(
            self.upstream.reconnect_min_delay,
            self.upstream.reconnect_max_delay,
        );

        while !self.handle.is_stopped() {
            self.stats.set_state(ConnectionState::Connecting);
            info!(
                host = %self.upstream.host,
                port = self.upstream.port,
                "gateway_connecting"
            );

            match self.connect_and_subscribe().await {
                Ok((write, read)) => {
                    backoff.reset();
                    info!(
                        host = %self.upstream.host,
                        port = self.upstream.port,
                        symbols = self.upstream.symbols.len(),
                        "gateway_connected"
                    );
                    self.notifier.resolve_alert(
                        DISCONNECT_CODE,
                        &today_trading_day(),
                        Some(DISCONNECT_CODE),
                        vec!["gateway connection re-established".to_string()],
                    );

                    if self.upstream.backfill_n > 0 {
                        self.stats.set_state(ConnectionState::Backfilling);
                        self.backfill_recent().await;
                    }
                    self.stats.set_state(ConnectionState::Running);

                    let reason = self.run_connection(write, read).await;
                    warn!(reason, "gateway_disconnected");
                }
                Err(err) => {
                    warn!(error = %err, "gateway connection error");
                    self.submit_disconnect_alert(&err);
                }
            }

            self.stats.set_state(ConnectionState::Reconnecting);
            if self.handle.is_stopped() {
                break;
            }
            let delay = backoff.next_delay();
            info!(delay_sec = format_args!("{delay:.1}"), "reconnecting");
            self.sleep_with_stop(Duration::from_secs_f64(delay)).await;
        }

        self.stats.set_state(ConnectionState::Disconnected);
    }

    async fn connect_and_subscribe(&mut self) -> Result<(WsWrite, WsRead)> {
        let (ws_stream, _) = connect_async(&self.upstream.ws_url()).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = build_subscribe_msg(&self.upstream.session, &self.upstream.symbols);
        write.send(Message::Text(subscribe.into())).await?;

        // The gateway acks with a `subscribed` frame before streaming.
        let ack = tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, async {
            while let Some(message) = read.next().await {
                match message? {
                    Message::Text(text) => {
                        match parse_gateway_frame(&text) {
                            Some(GatewayFrame::Subscribed { count }) => {
                                return Ok::<u64, AppError>(count)
                            }
                            Some(GatewayFrame::Error(message)) => {
                                return Err(AppError::Upstream(format!(
                                    "subscribe failed: {message}"
                                )))
                            }
                            _ => continue,
                        }
                    }
                    Message::Close(_) => {
                        return Err(AppError::Upstream(
                            "gateway closed during subscribe".to_string(),
                        ))
                    }
                    _ => continue,
                }
            }
            Err(AppError::Upstream("stream ended during subscribe".to_string()))
        })
        .await
        .map_err(|_| AppError::Upstream("subscribe ack timeout".to_string()))??;

        info!(
            count = ack,
            symbols = %self.upstream.symbols.join(","),
            "gateway_subscribed"
        );
        self.stats.set_state(ConnectionState::Subscribed);
        Ok((write, read))
    }

    /// Dispatch loop for one live connection. Returns the disconnect reason.
    async fn run_connection(&mut self, write: WsWrite, read: WsRead) -> &'static str {
        let (handoff_tx, mut handoff_rx) =
            mpsc::channel::<Vec<TickRow>>(HANDOFF_CHANNEL_CAPACITY);
        let reader = tokio::spawn(ws_reader_loop(write, read, handoff_tx));
        let handle = Arc::clone(&self.handle);

        let mut poll_interval = tokio::time::interval(Duration::from_secs(self.poll.interval_sec));
        let mut health_interval =
            tokio::time::interval(Duration::from_secs(HEALTH_LOG_INTERVAL_SEC));
        let mut probe_interval =
            tokio::time::interval(Duration::from_secs(self.upstream.check_interval_sec));
        // consume the immediate first ticks
        poll_interval.tick().await;
        health_interval.tick().await;
        probe_interval.tick().await;

        let reason = loop {
            tokio::select! {
                rows = handoff_rx.recv() => {
                    match rows {
                        Some(rows) => self.handle_push_rows(rows),
                        None => break "push stream ended",
                    }
                }
                _ = poll_interval.tick() => {
                    if self.poll.enabled {
                        self.poll_cycle().await;
                    }
                }
                _ = health_interval.tick() => {
                    self.health_cycle().await;
                }
                _ = probe_interval.tick() => {
                    if let Err(err) = self.probe_gateway().await {
                        warn!(error = %err, "gateway_probe_failed");
                        break "health probe failed";
                    }
                }
                _ = handle.stopped() => break "stop requested",
            }
        };

        reader.abort();
        let _ = reader.await;
        reason
    }

    fn handle_push_rows(&mut self, rows: Vec<TickRow>) {
        self.stats.record_seen_rows(&rows, true);
        let (enqueued, accepted_max) = self.handle_rows(rows, PushType::Push);
        for (symbol, seq) in accepted_max {
            self.stats.record_accepted_seq(&symbol, seq);
        }
        if enqueued > 0 {
            self.stats.add_push_rows(enqueued as u64);
        }
    }

    /// Enqueue a batch; on success remember composite keys and return the
    /// per-symbol max accepted seq for baseline advancement.
    fn handle_rows(
        &mut self,
        rows: Vec<TickRow>,
        source: PushType,
    ) -> (usize, HashMap<String, i64>) {
        if rows.is_empty() {
            return (0, HashMap::new());
        }
        let count = rows.len();

        let mut accepted_max: HashMap<String, i64> = HashMap::new();
        let mut keys: Vec<(String, CompositeKey)> = Vec::new();
        for row in &rows {
            match row.seq {
                Some(seq) => {
                    accepted_max
                        .entry(row.symbol.clone())
                        .and_modify(|current| *current = (*current).max(seq))
                        .or_insert(seq);
                }
                None => keys.push((row.symbol.clone(), row.composite_key())),
            }
        }

        if !self.queue.enqueue(rows) {
            self.stats.add_dropped_queue_full(count as u64);
            warn!(
                source = %source,
                rows = count,
                queue_size = self.queue.queue_size(),
                queue_maxsize = self.queue.queue_maxsize(),
                "enqueue_failed"
            );
            return (0, HashMap::new());
        }

        for (symbol, key) in keys {
            self.recent_keys.entry(symbol).or_default().remember(key);
        }
        (count, accepted_max)
    }

    fn should_skip_poll(&self, symbol: &str) -> bool {
        self.stats
            .last_push_age_sec(symbol)
            .is_some_and(|age| age < self.poll.stale_sec)
    }

    async fn poll_cycle(&mut self) {
        let symbols = self.upstream.symbols.clone();
        for symbol in symbols {
            if self.handle.is_stopped() {
                break;
            }
            if self.should_skip_poll(&symbol) {
                continue;
            }

            let raw = match self.fetch_rt_ticker(&symbol, self.poll.num).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "poll_error");
                    continue;
                }
            };
            let rows = raw_ticks_to_rows(raw, PushType::Poll, Some(&symbol));
            self.stats.record_seen_rows(&rows, false);

            let fetched = rows.len();
            let fetched_last_seq = rows.iter().filter_map(|row| row.seq).max();
            self.stats.add_poll_fetched(fetched as u64);
            self.stats.record_poll_seq_advance(&symbol, fetched_last_seq);

            let recent = self.recent_keys.entry(symbol.clone()).or_default();
            let (new_rows, dropped_duplicate, dropped_filter) =
                filter_polled_rows(&self.stats, recent, &symbol, rows);
            let accepted = new_rows.len();
            self.stats.add_poll_accepted(accepted as u64);
            self.stats.add_dropped_duplicate(dropped_duplicate);
            self.stats.add_dropped_filter(dropped_filter);

            let (enqueued, accepted_max) = if new_rows.is_empty() {
                (0, HashMap::new())
            } else {
                self.handle_rows(new_rows, PushType::Poll)
            };
            for (accepted_symbol, seq) in accepted_max {
                self.stats.record_accepted_seq(&accepted_symbol, seq);
            }
            self.stats.add_poll_enqueued(enqueued as u64);

            let dropped_queue_full = accepted.saturating_sub(enqueued);
            info!(
                symbol = %symbol,
                fetched,
                accepted,
                enqueued,
                dropped_queue_full,
                dropped_duplicate,
                dropped_filter,
                queue_size = self.queue.queue_size(),
                queue_maxsize = self.queue.queue_maxsize(),
                fetched_last_seq = fetched_last_seq.unwrap_or(-1),
                last_commit_age_sec = self.queue.last_commit_age_sec().unwrap_or(-1.0),
                ts_drift_sec = self.stats.drift_sec().unwrap_or(0.0),
                last_seen_seq = self.stats.last_seen_seq(&symbol).unwrap_or(-1),
                last_accepted_seq = self.stats.last_accepted_seq(&symbol).unwrap_or(-1),
                last_persisted_seq = self.stats.last_persisted_seq(&symbol).unwrap_or(-1),
                "poll_stats"
            );

            self.sleep_with_stop(Duration::from_millis(50)).await;
        }
    }

    /// One-shot post-subscribe fetch so a restart inside a session does not
    /// leave a hole before the first push.
    async fn backfill_recent(&mut self) {
        let symbols = self.upstream.symbols.clone();
        for symbol in symbols {
            if self.handle.is_stopped() {
                return;
            }
            let raw = match self.fetch_rt_ticker(&symbol, self.upstream.backfill_n).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "backfill_failed");
                    continue;
                }
            };
            let rows = raw_ticks_to_rows(raw, PushType::Backfill, Some(&symbol));
            self.stats.record_seen_rows(&rows, false);
            if rows.is_empty() {
                continue;
            }
            let fetched = rows.len();
            let (enqueued, accepted_max) = self.handle_rows(rows, PushType::Backfill);
            for (accepted_symbol, seq) in accepted_max {
                self.stats.record_accepted_seq(&accepted_symbol, seq);
            }
            info!(
                symbol = %symbol,
                fetched,
                enqueued,
                queue_size = self.queue.queue_size(),
                queue_maxsize = self.queue.queue_maxsize(),
                "backfill_stats"
            );
        }
    }

    async fn fetch_rt_ticker(&self, symbol: &str, num: usize) -> Result<Vec<RawTick>> {
        let url = format!(
            "{}/rt_ticker?symbol={}&num={}",
            self.upstream.http_base(),
            symbol,
            num
        );
        let response = self.http.get(&url).send().await?.error_for_status()?;
        Ok(response.json::<Vec<RawTick>>().await?)
    }

    async fn probe_gateway(&self) -> Result<()> {
        let url = format!("{}/state", self.upstream.http_base());
        self.http.get(&url).send().await?.error_for_status()?;
        Ok(())
    }

    async fn health_cycle(&mut self) {
        let counters = self.stats.counters();
        let delta = counters.delta_since(&self.prev_health_counters);
        self.prev_health_counters = counters;

        let pipeline = self.queue.snapshot_pipeline_counters(true);
        let queue_size = self.queue.queue_size();
        let queue_maxsize = self.queue.queue_maxsize();
        let drift_sec = self.stats.drift_sec();
        let max_ts_utc = format_ts_ms_utc(self.stats.max_ts_ms_seen());

        if let Some(drift) = drift_sec {
            if drift.abs() > self.drift_warn_sec as f64 {
                warn!(
                    drift_sec = format_args!("{drift:.1}"),
                    now_utc_ms = now_ms(),
                    max_ts_utc = %max_ts_utc,
                    "ts_drift_warn"
                );
            }
        }

        let mut symbols = Vec::with_capacity(self.upstream.symbols.len());
        let mut parts = Vec::with_capacity(self.upstream.symbols.len());
        for symbol in &self.upstream.symbols {
            let last_seen = self.stats.last_seen_seq(symbol);
            let last_persisted = self.stats.last_persisted_seq(symbol);
            let age = self.stats.last_tick_age_sec(symbol);
            let lag = match (last_seen, last_persisted) {
                (Some(seen), Some(persisted)) => (seen - persisted).max(0),
                (Some(seen), None) => seen,
                _ => 0,
            };
            parts.push(format!(
                "{symbol}:last_seen_seq={} last_accepted_seq={} last_persisted_seq={} last_tick_age_sec={}",
                last_seen.map_or("none".to_string(), |v| v.to_string()),
                self.stats
                    .last_accepted_seq(symbol)
                    .map_or("none".to_string(), |v| v.to_string()),
                last_persisted.map_or("none".to_string(), |v| v.to_string()),
                age.map_or("none".to_string(), |v| format!("{v:.1}")),
            ));
            symbols.push(SymbolSnapshot {
                symbol: symbol.clone(),
                last_tick_age_sec: age,
                last_persisted_seq: last_persisted,
                max_seq_lag: lag,
            });
        }

        info!(
            connected = self.stats.connected(),
            state = %self.stats.state(),
            queue = queue_size,
            queue_maxsize,
            push_rows_per_min = delta.push_rows,
            poll_fetched = delta.poll_fetched,
            poll_accepted = delta.poll_accepted,
            poll_enqueued = delta.poll_enqueued,
            persisted_rows_per_min = pipeline.persisted_rows,
            ignored_rows_per_min = pipeline.ignored_rows,
            queue_in = pipeline.queue_in_rows,
            queue_out = pipeline.queue_out_rows,
            db_commits_per_min = pipeline.db_commits,
            last_commit_age_sec = self.queue.last_commit_age_sec().unwrap_or(-1.0),
            ts_drift_sec = drift_sec.unwrap_or(0.0),
            max_ts_utc = %max_ts_utc,
            dropped_queue_full = delta.dropped_queue_full,
            dropped_duplicate = delta.dropped_duplicate,
            dropped_filter = delta.dropped_filter,
            symbols = %parts.join(" | "),
            "health"
        );

        let trading_day = today_trading_day();
        let db_rows = match self.store.count_rows(&trading_day).await {
            Ok(count) => count,
            Err(err) => {
                debug!(error = %err, "health_db_rows_unavailable");
                0
            }
        };

        self.notifier.submit_health(HealthSnapshot {
            created_at_ms: now_ms(),
            pid: std::process::id(),
            uptime_sec: self.stats.uptime_sec(),
            trading_day: trading_day.clone(),
            db_path: self.store.db_path(&trading_day),
            db_rows,
            db_max_ts_utc: max_ts_utc,
            drift_sec,
            queue_size,
            queue_maxsize,
            push_rows_per_min: delta.push_rows,
            poll_fetched: delta.poll_fetched,
            poll_accepted: delta.poll_accepted,
            persisted_rows_per_min: pipeline.persisted_rows,
            dropped_duplicate: delta.dropped_duplicate,
            symbols,
        });
    }

    fn submit_disconnect_alert(&self, err: &AppError) {
        self.notifier.submit_alert(AlertEvent {
            created_at_ms: now_ms(),
            code: DISCONNECT_CODE.to_string(),
            severity: Severity::Warn,
            trading_day: today_trading_day(),
            summary_lines: vec![
                format!("error={err}"),
                format!(
                    "gateway={}:{}",
                    self.upstream.host, self.upstream.port
                ),
            ],
            suggestions: vec!["check the quote gateway process and network".to_string()],
            headline: None,
            impact: None,
            fingerprint: Some(DISCONNECT_CODE.to_string()),
        });
    }

    async fn sleep_with_stop(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.handle.stopped() => {}
        }
    }
}

/// WS reader task: pings, pongs, parses frames, and crosses row batches into
/// the dispatch task through the bounded handoff channel. Never blocks on a
/// full channel; a hopelessly backed-up dispatch loop drops push batches the
/// same way the persist queue drops on overflow.
async fn ws_reader_loop(
    mut write: WsWrite,
    mut read: WsRead,
    handoff_tx: mpsc::Sender<Vec<TickRow>>,
) {
    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match parse_gateway_frame(&text) {
                            Some(GatewayFrame::Ticker(ticks)) => {
                                let rows = raw_ticks_to_rows(ticks, PushType::Push, None);
                                if rows.is_empty() {
                                    continue;
                                }
                                if handoff_tx.try_send(rows).is_err() {
                                    warn!("push handoff channel full, dropping batch");
                                }
                            }
                            Some(GatewayFrame::Error(message)) => {
                                warn!(message = %message, "gateway_error_frame");
                                return;
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("gateway closed the push stream");
                        return;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "push stream error");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = ping_interval.tick() => {
                debug!("ws ping");
                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(symbol: &str, seq: Option<i64>, ts_ms: i64, price: f64) -> TickRow {
        TickRow {
            market: "HK".into(),
            symbol: symbol.into(),
            ts_ms,
            price: Some(price),
            volume: Some(100),
            turnover: Some(100.0 * price),
            direction: None,
            seq,
            tick_type: None,
            push_type: PushType::Poll,
            provider: Some("gateway".into()),
            trading_day: "20240102".into(),
            recv_ts_ms: ts_ms,
            inserted_at_ms: 0,
        }
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut backoff = ExponentialBackoff::new(1, 8);
        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();
        let d4 = backoff.next_delay();
        let d5 = backoff.next_delay();
        assert!((1.0..2.0).contains(&d1), "{d1}");
        assert!((2.0..3.0).contains(&d2), "{d2}");
        assert!((4.0..5.0).contains(&d3), "{d3}");
        assert!((8.0..9.0).contains(&d4), "{d4}");
        assert!((8.0..9.0).contains(&d5), "{d5}");
        backoff.reset();
        assert!((1.0..2.0).contains(&backoff.next_delay()));
    }

    #[test]
    fn poll_filter_drops_seq_at_or_below_baseline() {
        let stats = UpstreamStats::new();
        stats.record_accepted_seq("HK.00700", 100);
        let recent = RecentKeySet::default();

        let rows = vec![
            row("HK.00700", Some(99), 1000, 1.0),
            row("HK.00700", Some(100), 1100, 1.0),
            row("HK.00700", Some(101), 1200, 1.0),
            row("HK.00700", Some(102), 1300, 1.0),
        ];
        let (kept, dup, filtered) = filter_polled_rows(&stats, &recent, "HK.00700", rows);
        assert_eq!(
            kept.iter().map(|r| r.seq.unwrap()).collect::<Vec<_>>(),
            vec![101, 102]
        );
        assert_eq!(dup, 2);
        assert_eq!(filtered, 0);
    }

    #[test]
    fn poll_filter_uses_max_of_accepted_and_persisted() {
        // Push accepted up to 110 while persistence confirmed only 100: a
        // poll racing the worker must not re-enqueue 101..=110.
        let stats = UpstreamStats::new();
        stats.record_accepted_seq("HK.00700", 110);
        stats.record_persist_result(&[row("HK.00700", Some(100), 1000, 1.0)]);
        let recent = RecentKeySet::default();

        let rows = vec![
            row("HK.00700", Some(105), 1000, 1.0),
            row("HK.00700", Some(111), 1100, 1.0),
        ];
        let (kept, dup, _) = filter_polled_rows(&stats, &recent, "HK.00700", rows);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].seq, Some(111));
        assert_eq!(dup, 1);
    }

    #[test]
    fn poll_filter_drops_duplicate_seq_within_batch() {
        let stats = UpstreamStats::new();
        let recent = RecentKeySet::default();
        let rows = vec![
            row("HK.00700", Some(5), 1000, 1.0),
            row("HK.00700", Some(5), 1000, 1.0),
        ];
        let (kept, dup, _) = filter_polled_rows(&stats, &recent, "HK.00700", rows);
        assert_eq!(kept.len(), 1);
        assert_eq!(dup, 1);
    }

    #[test]
    fn poll_filter_drops_foreign_symbols() {
        let stats = UpstreamStats::new();
        let recent = RecentKeySet::default();
        let rows = vec![
            row("HK.00005", Some(1), 1000, 1.0),
            row("HK.00700", Some(2), 1000, 1.0),
        ];
        let (kept, _, filtered) = filter_polled_rows(&stats, &recent, "HK.00700", rows);
        assert_eq!(kept.len(), 1);
        assert_eq!(filtered, 1);
    }

    #[test]
    fn poll_filter_dedupes_seqless_rows_by_composite_key() {
        let stats = UpstreamStats::new();
        let mut recent = RecentKeySet::default();
        recent.remember(row("HK.00700", None, 1000, 1.0).composite_key());

        let rows = vec![
            row("HK.00700", None, 1000, 1.0), // in recent set
            row("HK.00700", None, 2000, 1.0),
            row("HK.00700", None, 2000, 1.0), // duplicate within batch
            row("HK.00700", None, 2000, 1.5), // different price — distinct
        ];
        let (kept, dup, _) = filter_polled_rows(&stats, &recent, "HK.00700", rows);
        assert_eq!(kept.len(), 2);
        assert_eq!(dup, 2);
    }

    #[test]
    fn recent_key_set_evicts_fifo() {
        let mut recent = RecentKeySet::default();
        for i in 0..(POLL_RECENT_KEY_LIMIT + 10) {
            recent.remember(row("HK.00700", None, i as i64, 1.0).composite_key());
        }
        assert!(!recent.contains(&row("HK.00700", None, 5, 1.0).composite_key()));
        assert!(recent.contains(
            &row("HK.00700", None, (POLL_RECENT_KEY_LIMIT + 9) as i64, 1.0).composite_key()
        ));
        assert_eq!(recent.order.len(), POLL_RECENT_KEY_LIMIT);
    }
}
