//! In-memory commit-latency histogram for the persistence path.
//! The worker records, the heartbeat and /healthz read.

use std::sync::Mutex;

/// Shared commit latency stats, milliseconds per commit.
pub struct CommitLatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl CommitLatencyStats {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 3_600_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record_ms(&self, ms: u64) {
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(ms.max(1));
        }
    }

    /// Return (p50_ms, p95_ms, p99_ms). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.is_empty() {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommitLatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reports_percentiles() {
        let stats = CommitLatencyStats::new();
        assert_eq!(stats.percentiles(), (None, None, None));
        for ms in [5, 10, 20, 40, 80] {
            stats.record_ms(ms);
        }
        let (p50, p95, p99) = stats.percentiles();
        assert!(p50.unwrap() >= 10 && p50.unwrap() <= 40);
        assert!(p95.unwrap() >= p50.unwrap());
        assert!(p99.unwrap() >= p95.unwrap());
        assert_eq!(stats.len(), 5);
    }
}
