use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tick row — the unit of flow through every stage
// ---------------------------------------------------------------------------

/// How a row entered the pipeline. Persisted as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushType {
    Push,
    Poll,
    Backfill,
    Mock,
}

impl PushType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushType::Push => "push",
            PushType::Poll => "poll",
            PushType::Backfill => "backfill",
            PushType::Mock => "mock",
        }
    }
}

impl std::fmt::Display for PushType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single trade print, normalized at ingress. Immutable once enqueued —
/// dedupe decides inclusion at the store, never mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRow {
    pub market: String,
    /// Prefixed form `<market>.<code>`, e.g. `HK.00700`.
    pub symbol: String,
    /// UTC epoch milliseconds; monotone within (symbol, trading_day)
    /// under normal conditions.
    pub ts_ms: i64,
    pub price: Option<f64>,
    pub volume: Option<i64>,
    pub turnover: Option<f64>,
    pub direction: Option<String>,
    /// Upstream sequence number, strictly monotone per (symbol, trading_day)
    /// when present.
    pub seq: Option<i64>,
    pub tick_type: Option<String>,
    pub push_type: PushType,
    pub provider: Option<String>,
    /// Compact `YYYYMMDD` in Asia/Hong_Kong, derived from `ts_ms` when the
    /// upstream does not supply it.
    pub trading_day: String,
    /// UTC epoch ms observed at ingress.
    pub recv_ts_ms: i64,
    /// UTC epoch ms at first persistence attempt. Always populated.
    pub inserted_at_ms: i64,
}

impl TickRow {
    /// Composite dedupe key used for rows without a sequence number.
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            ts_ms: self.ts_ms,
            price_bits: self.price.map(f64::to_bits),
            volume: self.volume,
            turnover_bits: self.turnover.map(f64::to_bits),
        }
    }
}

/// Hashable stand-in for `(ts_ms, price, volume, turnover)`; floats are
/// compared by bit pattern which is exact for round-tripped wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub ts_ms: i64,
    pub price_bits: Option<u64>,
    pub volume: Option<i64>,
    pub turnover_bits: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_type_round_trips_lowercase() {
        assert_eq!(PushType::Push.as_str(), "push");
        assert_eq!(PushType::Backfill.to_string(), "backfill");
        let parsed: PushType = serde_json::from_str("\"poll\"").unwrap();
        assert_eq!(parsed, PushType::Poll);
    }

    #[test]
    fn composite_key_distinguishes_price() {
        let base = TickRow {
            market: "HK".into(),
            symbol: "HK.00700".into(),
            ts_ms: 1_704_159_000_500,
            price: Some(300.5),
            volume: Some(100),
            turnover: Some(30_050.0),
            direction: None,
            seq: None,
            tick_type: None,
            push_type: PushType::Poll,
            provider: Some("gateway".into()),
            trading_day: "20240102".into(),
            recv_ts_ms: 1_704_159_000_600,
            inserted_at_ms: 0,
        };
        let mut other = base.clone();
        other.price = Some(300.6);
        assert_eq!(base.composite_key(), base.clone().composite_key());
        assert_ne!(base.composite_key(), other.composite_key());
    }
}
