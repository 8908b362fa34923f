//! Daily quality accumulation: per-symbol hard-gap / soft-stall counts fed by
//! the persist worker after each commit, summarized into the shard's
//! `daily_quality` row and a JSON report under `_reports/quality/`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::hk_time::now_ms;
use crate::quality::gap::GapPlan;
use crate::types::TickRow;

pub const REPORT_REL_DIR: &str = "_reports/quality";

#[derive(Debug, Default, Clone, Serialize)]
pub struct SymbolQuality {
    pub rows_accepted: u64,
    pub hard_gaps: u64,
    pub soft_stalls: u64,
    pub max_gap_sec: f64,
    pub last_gap_end_ts_ms: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DayQuality {
    pub trading_day: String,
    pub generated_at_ms: i64,
    pub rows_inserted: u64,
    pub rows_ignored: u64,
    pub commits: u64,
    pub symbols: BTreeMap<String, SymbolQuality>,
}

/// Thread-safe accumulator shared between the persist worker (writes) and
/// the heartbeat (report flush).
pub struct QualityReport {
    report_dir: PathBuf,
    days: Mutex<HashMap<String, DayQuality>>,
    dirty: Mutex<HashSet<String>>,
}

impl QualityReport {
    pub fn new(data_root: &Path) -> Self {
        Self {
            report_dir: data_root.join(REPORT_REL_DIR),
            days: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Fold one committed batch into the day summary and return the updated
    /// `summary_json` for the shard's `daily_quality` upsert.
    pub fn record_commit(
        &self,
        trading_day: &str,
        rows: &[TickRow],
        inserted: u64,
        ignored: u64,
        plan: Option<&GapPlan>,
    ) -> String {
        let Ok(mut days) = self.days.lock() else {
            return "{}".to_string();
        };
        let day = days.entry(trading_day.to_string()).or_default();
        day.trading_day = trading_day.to_string();
        day.generated_at_ms = now_ms();
        day.rows_inserted += inserted;
        day.rows_ignored += ignored;
        day.commits += 1;

        for row in rows {
            day.symbols
                .entry(row.symbol.clone())
                .or_default()
                .rows_accepted += 1;
        }

        if let Some(plan) = plan {
            for gap in &plan.hard_gaps {
                let entry = day.symbols.entry(gap.symbol.clone()).or_default();
                entry.hard_gaps += 1;
                if gap.gap_sec > entry.max_gap_sec {
                    entry.max_gap_sec = gap.gap_sec;
                }
                entry.last_gap_end_ts_ms = Some(gap.gap_end_ts_ms);
            }
            for stall in &plan.soft_stalls {
                day.symbols
                    .entry(stall.symbol.clone())
                    .or_default()
                    .soft_stalls += 1;
            }
        }

        let summary = serde_json::to_string(day).unwrap_or_else(|_| "{}".to_string());
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(trading_day.to_string());
        }
        summary
    }

    /// Symbols seen for the day, as a JSON array.
    pub fn symbols_json(&self, trading_day: &str) -> String {
        let Ok(days) = self.days.lock() else {
            return "[]".to_string();
        };
        let symbols: Vec<&String> = days
            .get(trading_day)
            .map(|day| day.symbols.keys().collect())
            .unwrap_or_default();
        serde_json::to_string(&symbols).unwrap_or_else(|_| "[]".to_string())
    }

    /// Days with unflushed updates; clears the dirty set.
    pub fn take_dirty_days(&self) -> Vec<String> {
        match self.dirty.lock() {
            Ok(mut dirty) => dirty.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Write `<data_root>/_reports/quality/<day>.json`.
    pub fn write_file(&self, trading_day: &str) -> Result<PathBuf> {
        let path = self.report_dir.join(format!("{trading_day}.json"));
        let snapshot = match self.days.lock() {
            Ok(days) => days.get(trading_day).cloned(),
            Err(_) => None,
        };
        let Some(day) = snapshot else {
            return Ok(path);
        };

        std::fs::create_dir_all(&self.report_dir)?;
        let body = serde_json::to_string_pretty(&day)?;
        std::fs::write(&path, body)?;
        info!(
            trading_day,
            path = %path.display(),
            rows_inserted = day.rows_inserted,
            symbols = day.symbols.len(),
            "quality_report_written"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PushType;

    fn row(symbol: &str, ts_ms: i64) -> TickRow {
        TickRow {
            market: "HK".into(),
            symbol: symbol.into(),
            ts_ms,
            price: Some(1.0),
            volume: Some(1),
            turnover: Some(1.0),
            direction: None,
            seq: Some(ts_ms),
            tick_type: None,
            push_type: PushType::Push,
            provider: None,
            trading_day: "20240102".into(),
            recv_ts_ms: 0,
            inserted_at_ms: 0,
        }
    }

    #[test]
    fn accumulates_and_round_trips_summary() {
        let dir = tempfile::tempdir().unwrap();
        let report = QualityReport::new(dir.path());

        let rows = vec![
            row("HK.00700", 1000),
            row("HK.00700", 2000),
            row("HK.00005", 1500),
        ];
        let summary = report.record_commit("20240102", &rows, 3, 0, None);
        let parsed: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(parsed["rows_inserted"], 3);
        assert_eq!(parsed["symbols"]["HK.00700"]["rows_accepted"], 2);

        let summary = report.record_commit("20240102", &[row("HK.00700", 3000)], 0, 1, None);
        let parsed: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(parsed["commits"], 2);
        assert_eq!(parsed["rows_ignored"], 1);

        let mut dirty = report.take_dirty_days();
        dirty.sort();
        assert_eq!(dirty, vec!["20240102"]);
        assert!(report.take_dirty_days().is_empty());

        let path = report.write_file("20240102").unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["trading_day"], "20240102");
        assert_eq!(parsed["symbols"]["HK.00005"]["rows_accepted"], 1);
    }

    #[test]
    fn symbols_json_lists_seen_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let report = QualityReport::new(dir.path());
        report.record_commit("20240102", &[row("HK.00700", 1000)], 1, 0, None);
        let symbols: Vec<String> = serde_json::from_str(&report.symbols_json("20240102")).unwrap();
        assert_eq!(symbols, vec!["HK.00700"]);
        assert_eq!(report.symbols_json("20240103"), "[]");
    }
}
