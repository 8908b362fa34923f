//! HK market calendar: configurable trading sessions for gap classification,
//! a holiday set, and the coarse market mode used by the notifier.

use std::collections::HashSet;
use std::path::Path;

use chrono::{NaiveTime, TimeZone, Utc, Weekday};
use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::{AppError, Result};
use crate::hk_time::HK_TZ;

// ---------------------------------------------------------------------------
// Trading sessions
// ---------------------------------------------------------------------------

/// One local `(start, end)` window, e.g. `09:30-12:00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradingSession {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub label: String,
}

/// Parse a comma-separated session list like `09:30-12:00,13:00-16:00`.
pub fn parse_trading_sessions(value: &str) -> Result<Vec<TradingSession>> {
    let mut sessions = Vec::new();
    for raw in value.split(',') {
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }
        let (start_text, end_text) = text
            .split_once('-')
            .ok_or_else(|| AppError::Config(format!("invalid TRADING_SESSIONS item: {text}")))?;
        let start = parse_hhmm(start_text.trim())?;
        let end = parse_hhmm(end_text.trim())?;
        if start >= end {
            return Err(AppError::Config(format!(
                "session start must be before end: {text}"
            )));
        }
        sessions.push(TradingSession {
            start,
            end,
            label: text.to_string(),
        });
    }
    if sessions.is_empty() {
        return Err(AppError::Config("TRADING_SESSIONS is empty".to_string()));
    }
    Ok(sessions)
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    let (hh, mm) = value
        .split_once(':')
        .ok_or_else(|| AppError::Config(format!("invalid time format: {value}")))?;
    let hour: u32 = hh
        .parse()
        .map_err(|_| AppError::Config(format!("invalid time format: {value}")))?;
    let minute: u32 = mm
        .parse()
        .map_err(|_| AppError::Config(format!("invalid time format: {value}")))?;
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| AppError::Config(format!("invalid time range: {value}")))
}

// ---------------------------------------------------------------------------
// Holiday calendar
// ---------------------------------------------------------------------------

/// Configured non-trading weekdays, compact `YYYYMMDD` keys.
#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    holidays: HashSet<String>,
}

impl MarketCalendar {
    pub fn new(holidays: &[String], holiday_file: &str) -> Self {
        let mut merged = HashSet::new();
        for value in holidays {
            if let Some(day) = normalize_day(value) {
                merged.insert(day);
            }
        }
        merged.extend(load_holiday_file(holiday_file));
        Self { holidays: merged }
    }

    pub fn is_holiday(&self, trading_day: &str) -> bool {
        self.holidays.contains(trading_day)
    }
}

fn normalize_day(value: &str) -> Option<String> {
    let text: String = value
        .trim()
        .chars()
        .filter(|c| *c != '-' && *c != '/')
        .collect();
    if text.len() == 8 && text.chars().all(|c| c.is_ascii_digit()) {
        Some(text)
    } else {
        None
    }
}

fn load_holiday_file(holiday_file: &str) -> HashSet<String> {
    let path_text = holiday_file.trim();
    if path_text.is_empty() {
        return HashSet::new();
    }
    let path = Path::new(path_text);
    let Ok(contents) = std::fs::read_to_string(path) else {
        warn!(path = %path.display(), "market_calendar_holiday_file_not_found");
        return HashSet::new();
    };

    contents
        .lines()
        .filter_map(|line| {
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                return None;
            }
            normalize_day(text.split(',').next().unwrap_or(text))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Session classification for the gap detector
// ---------------------------------------------------------------------------

/// Session lookup bound to a timezone and holiday set. Weekends and holidays
/// yield no session, which suppresses all gap emission.
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    tz: Tz,
    sessions: Vec<TradingSession>,
    calendar: MarketCalendar,
}

impl SessionCalendar {
    pub fn new(tz: Tz, sessions: Vec<TradingSession>, calendar: MarketCalendar) -> Self {
        Self {
            tz,
            sessions,
            calendar,
        }
    }

    /// Index of the session containing `ts_ms` in local time, if any.
    pub fn session_index(&self, ts_ms: i64) -> Option<usize> {
        let local = Utc
            .timestamp_millis_opt(ts_ms)
            .single()?
            .with_timezone(&self.tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return None;
        }
        let day = local.format("%Y%m%d").to_string();
        if self.calendar.is_holiday(&day) {
            return None;
        }
        let current = local.time();
        self.sessions
            .iter()
            .position(|s| s.start <= current && current < s.end)
    }

    pub fn session_label(&self, index: usize) -> &str {
        self.sessions
            .get(index)
            .map(|s| s.label.as_str())
            .unwrap_or("unknown")
    }
}

// ---------------------------------------------------------------------------
// Market mode for the notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketMode {
    PreOpen,
    Open,
    LunchBreak,
    AfterHours,
    HolidayClosed,
}

impl MarketMode {
    /// Trading modes are the ones where drift/stall against the clock is
    /// meaningful; off-session drift never raises severity on its own.
    pub fn is_trading(&self) -> bool {
        matches!(self, MarketMode::PreOpen | MarketMode::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::PreOpen => "pre-open",
            MarketMode::Open => "open",
            MarketMode::LunchBreak => "lunch-break",
            MarketMode::AfterHours => "after-hours",
            MarketMode::HolidayClosed => "holiday-closed",
        }
    }
}

impl std::fmt::Display for MarketMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse HK market mode at `now_ms`, using the fixed HKEX day structure.
pub fn resolve_market_mode(now_ms: i64, calendar: &MarketCalendar) -> MarketMode {
    let Some(local) = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .map(|dt| dt.with_timezone(&HK_TZ))
    else {
        return MarketMode::AfterHours;
    };

    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return MarketMode::AfterHours;
    }
    let day = local.format("%Y%m%d").to_string();
    if calendar.is_holiday(&day) {
        return MarketMode::HolidayClosed;
    }

    let minutes = local.hour() * 60 + local.minute();
    match minutes {
        m if (540..570).contains(&m) => MarketMode::PreOpen, // 09:00-09:30
        m if (570..720).contains(&m) => MarketMode::Open,    // 09:30-12:00
        m if (720..780).contains(&m) => MarketMode::LunchBreak, // 12:00-13:00
        m if (780..960).contains(&m) => MarketMode::Open,    // 13:00-16:00
        _ => MarketMode::AfterHours,
    }
}
