use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::calendar::MarketMode;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warn,
    Alert,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::Warn => 1,
            Severity::Alert => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warn => "WARN",
            Severity::Alert => "ALERT",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Health snapshot — periodic summary produced by the client's health loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub last_tick_age_sec: Option<f64>,
    pub last_persisted_seq: Option<i64>,
    pub max_seq_lag: i64,
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub created_at_ms: i64,
    pub pid: u32,
    pub uptime_sec: u64,
    pub trading_day: String,
    pub db_path: PathBuf,
    pub db_rows: i64,
    pub db_max_ts_utc: String,
    pub drift_sec: Option<f64>,
    pub queue_size: usize,
    pub queue_maxsize: usize,
    pub push_rows_per_min: u64,
    pub poll_fetched: u64,
    pub poll_accepted: u64,
    pub persisted_rows_per_min: u64,
    pub dropped_duplicate: u64,
    pub symbols: Vec<SymbolSnapshot>,
}

impl HealthSnapshot {
    pub fn queue_utilization_pct(&self) -> f64 {
        if self.queue_maxsize == 0 {
            return 0.0;
        }
        (self.queue_size as f64 / self.queue_maxsize as f64) * 100.0
    }

    pub fn max_symbol_lag(&self) -> i64 {
        self.symbols
            .iter()
            .map(|s| s.max_seq_lag.max(0))
            .max()
            .unwrap_or(0)
    }

    pub fn max_symbol_age_sec(&self) -> Option<f64> {
        self.symbols
            .iter()
            .filter_map(|s| s.last_tick_age_sec)
            .fold(None, |acc, age| Some(acc.map_or(age, |a: f64| a.max(age))))
    }
}

// ---------------------------------------------------------------------------
// Alert event — discrete, deduplicated by fingerprint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub created_at_ms: i64,
    pub code: String,
    pub severity: Severity,
    pub trading_day: String,
    pub summary_lines: Vec<String>,
    pub suggestions: Vec<String>,
    pub headline: Option<String>,
    pub impact: Option<String>,
    pub fingerprint: Option<String>,
}

impl AlertEvent {
    /// Stable dedupe key, defaulting to `<code>:<trading_day>`.
    pub fn fingerprint(&self) -> String {
        self.fingerprint
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| format!("{}:{}", self.code, self.trading_day))
    }
}

// ---------------------------------------------------------------------------
// Rendering / delivery plumbing
// ---------------------------------------------------------------------------

/// Formatting-agnostic rendered message; `parse_mode` is empty for plain
/// text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub text: String,
    pub parse_mode: String,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub ok: bool,
    pub status_code: u16,
    pub retry_after: Option<u64>,
    pub error: Option<String>,
}

impl SendResult {
    pub fn success() -> Self {
        Self {
            ok: true,
            status_code: 200,
            retry_after: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthAssessment {
    pub severity: Severity,
    pub conclusion: String,
    pub impact: String,
    pub needs_action: bool,
    pub market_mode: MarketMode,
}

/// A rendered message waiting in the delivery queue.
#[derive(Debug, Clone)]
pub(crate) struct OutboundMessage {
    pub kind: String,
    pub message: RenderedMessage,
    pub severity: Severity,
    pub fingerprint: String,
}
