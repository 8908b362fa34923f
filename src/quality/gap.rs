//! Session-aware hard-gap / soft-stall classification over newly accepted
//! rows. `build_plan` is pure so a batch can be classified up front, the gap
//! records inserted in the same transaction as the ticks, and detector state
//! advanced only once the commit succeeded.

use std::collections::{HashMap, VecDeque};

use serde_json::json;

use crate::calendar::SessionCalendar;
use crate::config::QualityConfig;
use crate::types::TickRow;

pub const HARD_GAP_REASON: &str = "hard_gap";

/// Persisted hard gap, primary key `(symbol, gap_start_ts_ms, gap_end_ts_ms)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HardGapRecord {
    pub trading_day: String,
    pub symbol: String,
    pub gap_start_ts_ms: i64,
    pub gap_end_ts_ms: i64,
    pub gap_sec: f64,
    pub reason: &'static str,
    pub meta_json: String,
}

/// Intra-session gap above the stall-warn threshold but below the hard
/// threshold. Never persisted; surfaced through the quality report only.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftStallObservation {
    pub trading_day: String,
    pub symbol: String,
    pub stall_start_ts_ms: i64,
    pub stall_end_ts_ms: i64,
    pub stall_sec: f64,
    pub meta_json: String,
}

#[derive(Debug, Clone)]
struct StateSnapshot {
    last_ts_ms: Option<i64>,
    recent_ts_ms: Vec<i64>,
}

/// Output of `build_plan`: gaps/stalls to surface plus the per-symbol state
/// the detector should advance to once the batch commits.
#[derive(Debug, Clone)]
pub struct GapPlan {
    pub hard_gaps: Vec<HardGapRecord>,
    pub soft_stalls: Vec<SoftStallObservation>,
    next_states: HashMap<String, StateSnapshot>,
}

impl GapPlan {
    pub fn is_empty(&self) -> bool {
        self.hard_gaps.is_empty() && self.soft_stalls.is_empty()
    }
}

#[derive(Debug, Clone)]
struct SymbolState {
    last_ts_ms: Option<i64>,
    recent_ts_ms: VecDeque<i64>,
}

pub struct GapDetector {
    enabled: bool,
    gap_threshold_sec: f64,
    gap_stall_warn_sec: f64,
    active_window_ms: i64,
    active_min_ticks: usize,
    calendar: SessionCalendar,
    states: HashMap<String, SymbolState>,
}

impl GapDetector {
    pub fn new(config: &QualityConfig, calendar: SessionCalendar) -> Self {
        Self {
            enabled: config.gap_enabled,
            gap_threshold_sec: config.gap_threshold_sec,
            gap_stall_warn_sec: config.gap_stall_warn_sec,
            active_window_ms: (config.gap_active_window_sec as i64) * 1000,
            active_min_ticks: config.gap_active_min_ticks,
            calendar,
            states: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Classify a batch without mutating detector state.
    pub fn build_plan(&self, rows: &[TickRow]) -> GapPlan {
        let mut grouped: HashMap<&str, Vec<&TickRow>> = HashMap::new();
        for row in rows {
            if row.symbol.is_empty() {
                continue;
            }
            grouped.entry(row.symbol.as_str()).or_default().push(row);
        }

        let mut hard_gaps = Vec::new();
        let mut soft_stalls = Vec::new();
        let mut next_states = HashMap::new();

        for (symbol, mut symbol_rows) in grouped {
            symbol_rows.sort_by_key(|row| (row.ts_ms, row.seq.unwrap_or(-1)));

            let (mut last_ts_ms, mut recent) = match self.states.get(symbol) {
                Some(state) => (state.last_ts_ms, state.recent_ts_ms.clone()),
                None => (None, VecDeque::new()),
            };

            for row in symbol_rows {
                let curr_ts = row.ts_ms;
                self.trim_recent(&mut recent, curr_ts);
                let active_count = recent.len() + 1;
                let active = active_count >= self.active_min_ticks;

                if let Some(prev_ts) = last_ts_ms {
                    if curr_ts > prev_ts && active {
                        self.classify_pair(
                            row,
                            symbol,
                            prev_ts,
                            curr_ts,
                            active_count,
                            &mut hard_gaps,
                            &mut soft_stalls,
                        );
                    }
                }

                if last_ts_ms.map_or(true, |prev| curr_ts > prev) {
                    last_ts_ms = Some(curr_ts);
                    recent.push_back(curr_ts);
                    self.trim_recent(&mut recent, curr_ts);
                }
            }

            next_states.insert(
                symbol.to_string(),
                StateSnapshot {
                    last_ts_ms,
                    recent_ts_ms: recent.into_iter().collect(),
                },
            );
        }

        GapPlan {
            hard_gaps,
            soft_stalls,
            next_states,
        }
    }

    /// Commit the per-symbol state advanced by a plan whose batch persisted.
    pub fn apply_plan(&mut self, plan: &GapPlan) {
        for (symbol, snapshot) in &plan.next_states {
            self.states.insert(
                symbol.clone(),
                SymbolState {
                    last_ts_ms: snapshot.last_ts_ms,
                    recent_ts_ms: snapshot.recent_ts_ms.iter().copied().collect(),
                },
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_pair(
        &self,
        row: &TickRow,
        symbol: &str,
        prev_ts: i64,
        curr_ts: i64,
        active_count: usize,
        hard_gaps: &mut Vec<HardGapRecord>,
        soft_stalls: &mut Vec<SoftStallObservation>,
    ) {
        let prev_session = self.calendar.session_index(prev_ts);
        let curr_session = self.calendar.session_index(curr_ts);
        let (Some(prev_idx), Some(curr_idx)) = (prev_session, curr_session) else {
            return;
        };
        if prev_idx != curr_idx {
            return;
        }

        let delta_sec = (curr_ts - prev_ts) as f64 / 1000.0;
        let session_label = self.calendar.session_label(curr_idx);

        if delta_sec > self.gap_threshold_sec {
            let meta = json!({
                "prev_ts_ms": prev_ts,
                "curr_ts_ms": curr_ts,
                "gap_threshold_sec": self.gap_threshold_sec,
                "active_window_sec": self.active_window_ms / 1000,
                "active_min_ticks": self.active_min_ticks,
                "active_count": active_count,
                "session": session_label,
            });
            hard_gaps.push(HardGapRecord {
                trading_day: row.trading_day.clone(),
                symbol: symbol.to_string(),
                gap_start_ts_ms: prev_ts,
                gap_end_ts_ms: curr_ts,
                gap_sec: round3(delta_sec),
                reason: HARD_GAP_REASON,
                meta_json: meta.to_string(),
            });
        } else if delta_sec > self.gap_stall_warn_sec {
            let meta = json!({
                "prev_ts_ms": prev_ts,
                "curr_ts_ms": curr_ts,
                "stall_warn_sec": self.gap_stall_warn_sec,
                "active_count": active_count,
                "session": session_label,
            });
            soft_stalls.push(SoftStallObservation {
                trading_day: row.trading_day.clone(),
                symbol: symbol.to_string(),
                stall_start_ts_ms: prev_ts,
                stall_end_ts_ms: curr_ts,
                stall_sec: round3(delta_sec),
                meta_json: meta.to_string(),
            });
        }
    }

    fn trim_recent(&self, recent: &mut VecDeque<i64>, current_ts_ms: i64) {
        let min_ts_ms = current_ts_ms - self.active_window_ms;
        while recent.front().is_some_and(|ts| *ts < min_ts_ms) {
            recent.pop_front();
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{parse_trading_sessions, MarketCalendar};
    use crate::hk_time::HK_TZ;
    use crate::types::PushType;
    use chrono::TimeZone;

    fn quality_config(min_ticks: usize) -> QualityConfig {
        QualityConfig {
            gap_enabled: true,
            gap_threshold_sec: 10.0,
            gap_active_window_sec: 300,
            gap_active_min_ticks: min_ticks,
            gap_stall_warn_sec: 5.0,
            trading_tz: HK_TZ,
            sessions: parse_trading_sessions("09:30-12:00,13:00-16:00").unwrap(),
            holidays: vec![],
            holiday_file: String::new(),
        }
    }

    fn detector(min_ticks: usize, holidays: &[String]) -> GapDetector {
        let config = quality_config(min_ticks);
        let calendar = SessionCalendar::new(
            config.trading_tz,
            config.sessions.clone(),
            MarketCalendar::new(holidays, ""),
        );
        GapDetector::new(&config, calendar)
    }

    fn hk_ts(day: &str, hms: &str) -> i64 {
        let naive =
            chrono::NaiveDateTime::parse_from_str(&format!("{day} {hms}"), "%Y%m%d %H:%M:%S")
                .unwrap();
        HK_TZ
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn tick(day: &str, hms: &str, seq: i64) -> TickRow {
        TickRow {
            market: "HK".into(),
            symbol: "HK.00700".into(),
            ts_ms: hk_ts(day, hms),
            price: Some(300.5),
            volume: Some(100),
            turnover: Some(30_050.0),
            direction: None,
            seq: Some(seq),
            tick_type: None,
            push_type: PushType::Push,
            provider: Some("gateway".into()),
            trading_day: day.to_string(),
            recv_ts_ms: 0,
            inserted_at_ms: 0,
        }
    }

    #[test]
    fn hard_gap_emitted_for_active_symbol() {
        let mut det = detector(3, &[]);
        // 2024-01-02 is a Tuesday; 09:30:00..02 then a jump to 09:30:20.
        let rows = vec![
            tick("20240102", "09:30:00", 1),
            tick("20240102", "09:30:01", 2),
            tick("20240102", "09:30:02", 3),
            tick("20240102", "09:30:20", 4),
        ];
        let plan = det.build_plan(&rows);
        assert_eq!(plan.hard_gaps.len(), 1);
        let gap = &plan.hard_gaps[0];
        assert_eq!(gap.gap_sec, 18.0);
        assert_eq!(gap.reason, "hard_gap");
        assert_eq!(gap.gap_start_ts_ms, hk_ts("20240102", "09:30:02"));
        assert_eq!(gap.gap_end_ts_ms, hk_ts("20240102", "09:30:20"));
        let meta: serde_json::Value = serde_json::from_str(&gap.meta_json).unwrap();
        assert_eq!(meta["session"], "09:30-12:00");
        assert_eq!(meta["active_min_ticks"], 3);
        det.apply_plan(&plan);
    }

    #[test]
    fn soft_stall_between_warn_and_threshold() {
        let det = detector(2, &[]);
        let rows = vec![
            tick("20240102", "09:30:00", 1),
            tick("20240102", "09:30:01", 2),
            tick("20240102", "09:30:08", 3),
        ];
        let plan = det.build_plan(&rows);
        assert!(plan.hard_gaps.is_empty());
        assert_eq!(plan.soft_stalls.len(), 1);
        assert_eq!(plan.soft_stalls[0].stall_sec, 7.0);
    }

    #[test]
    fn inactive_symbol_emits_nothing() {
        let det = detector(5, &[]);
        let rows = vec![
            tick("20240102", "09:30:00", 1),
            tick("20240102", "09:30:20", 2),
        ];
        let plan = det.build_plan(&rows);
        assert!(plan.is_empty());
    }

    #[test]
    fn gap_never_spans_two_sessions() {
        let mut det = detector(1, &[]);
        let warmup = vec![
            tick("20240102", "11:59:00", 1),
            tick("20240102", "11:59:30", 2),
        ];
        det.apply_plan(&det.build_plan(&warmup));
        // Lunch break between 11:59:30 and 13:00:05 — different session index.
        let plan = det.build_plan(&[tick("20240102", "13:00:05", 3)]);
        assert!(plan.hard_gaps.is_empty());
        assert!(plan.soft_stalls.is_empty());
    }

    #[test]
    fn weekends_and_holidays_suppressed() {
        // 2024-01-06 is a Saturday.
        let det = detector(1, &[]);
        let rows = vec![
            tick("20240106", "09:30:00", 1),
            tick("20240106", "09:31:00", 2),
        ];
        assert!(det.build_plan(&rows).is_empty());

        let det = detector(1, &["20240102".to_string()]);
        let rows = vec![
            tick("20240102", "09:30:00", 1),
            tick("20240102", "09:31:00", 2),
        ];
        assert!(det.build_plan(&rows).is_empty());
    }

    #[test]
    fn build_plan_is_pure_until_applied() {
        let mut det = detector(1, &[]);
        let first = vec![tick("20240102", "09:30:00", 1)];
        let plan = det.build_plan(&first);

        // Without apply_plan the detector has no last_ts baseline, so the
        // follow-up row cannot form a gap pair.
        let follow = vec![tick("20240102", "09:31:00", 2)];
        assert!(det.build_plan(&follow).is_empty());

        det.apply_plan(&plan);
        let plan = det.build_plan(&follow);
        assert_eq!(plan.hard_gaps.len(), 1);
        assert_eq!(plan.hard_gaps[0].gap_sec, 60.0);
    }

    #[test]
    fn out_of_order_rows_do_not_regress_state() {
        let mut det = detector(1, &[]);
        let warmup = vec![tick("20240102", "09:40:00", 5)];
        det.apply_plan(&det.build_plan(&warmup));

        // A late row older than last_ts must not emit or move the baseline.
        let plan = det.build_plan(&[tick("20240102", "09:39:00", 4)]);
        assert!(plan.is_empty());
        det.apply_plan(&plan);

        let plan = det.build_plan(&[tick("20240102", "09:40:30", 6)]);
        assert_eq!(plan.hard_gaps.len(), 1);
        assert_eq!(plan.hard_gaps[0].gap_start_ts_ms, hk_ts("20240102", "09:40:00"));
    }
}
