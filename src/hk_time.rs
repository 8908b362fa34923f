//! UTC/Hong-Kong time handling: trading-day bucketing, upstream time-field
//! parsing, and the mislabeled-HKT future-timestamp correction.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

pub const HK_TZ: Tz = chrono_tz::Asia::Hong_Kong;

pub const HK_OFFSET_MS: i64 = 8 * 3600 * 1000;
/// Timestamps further than this in the future trigger the mislabel check.
pub const FUTURE_GUARD_MS: i64 = 2 * 3600 * 1000;
/// Tolerance around exactly +8h for treating a future ts as mislabeled HKT.
pub const FUTURE_CORRECTION_TOLERANCE_MS: i64 = 30 * 60 * 1000;

/// Current UTC epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Compact `YYYYMMDD` bucket for `ts_ms` in Asia/Hong_Kong.
pub fn trading_day_from_ts(ts_ms: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.with_timezone(&HK_TZ).format("%Y%m%d").to_string())
        .unwrap_or_else(|| "19700101".to_string())
}

/// Current trading day in Asia/Hong_Kong.
pub fn today_trading_day() -> String {
    trading_day_from_ts(now_ms())
}

/// Normalize `YYYYMMDD` / `YYYY-MM-DD` / `YYYY/MM/DD` to compact form.
pub fn normalize_trading_day(value: Option<&str>) -> Option<String> {
    let text = value?.trim();
    if text.is_empty() {
        return None;
    }
    if text.len() == 8 && text.chars().all(|c| c.is_ascii_digit()) {
        return Some(text.to_string());
    }
    if text.contains('-') {
        return Some(text.replace('-', ""));
    }
    if text.contains('/') {
        return Some(text.replace('/', ""));
    }
    Some(text.to_string())
}

/// Apply the timezone-mislabel correction: a value implausibly in the future
/// by ~8h (within ±30min) is an HKT wall-clock stamped as UTC; subtract
/// exactly 8h. Anything under the +2h guard passes through untouched.
pub fn normalize_epoch_ms(ts_ms: i64, now_ms: i64) -> i64 {
    if ts_ms <= now_ms + FUTURE_GUARD_MS {
        return ts_ms;
    }
    let drift_ms = ts_ms - now_ms;
    if (drift_ms - HK_OFFSET_MS).abs() <= FUTURE_CORRECTION_TOLERANCE_MS {
        let corrected = ts_ms - HK_OFFSET_MS;
        warn!(
            raw_ts_ms = ts_ms,
            corrected_ts_ms = corrected,
            drift_ms,
            "ts_ms_future_offset_corrected"
        );
        return corrected;
    }
    ts_ms
}

/// Parse the upstream `time` field into UTC epoch ms.
///
/// Accepts numeric epochs (seconds or milliseconds), compact `HHMMSS` /
/// `YYYYMMDDHHMMSS`, datetime text (`-`, `/` or `T` separated, optional
/// fraction, optional RFC3339 offset), and time-only `HH:MM:SS[.f]` resolved
/// against `trading_day`. Naive datetimes are interpreted in Asia/Hong_Kong.
/// Returns `None` when nothing matches; callers drop the row.
pub fn parse_time_to_ts_ms(
    value: &serde_json::Value,
    trading_day: Option<&str>,
    now_ms: i64,
) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => {
            let numeric = n.as_f64()?;
            Some(numeric_to_epoch_ms(numeric, now_ms))
        }
        serde_json::Value::String(s) => parse_time_text(s.trim(), trading_day, now_ms),
        _ => None,
    }
}

fn numeric_to_epoch_ms(numeric: f64, now_ms: i64) -> i64 {
    if numeric > 1e12 {
        normalize_epoch_ms(numeric as i64, now_ms)
    } else if numeric > 1e9 {
        normalize_epoch_ms((numeric * 1000.0) as i64, now_ms)
    } else {
        numeric as i64
    }
}

fn parse_time_text(text: &str, trading_day: Option<&str>, now_ms: i64) -> Option<i64> {
    if text.is_empty() {
        return None;
    }

    if text.chars().all(|c| c.is_ascii_digit()) {
        if text.len() == 6 {
            let day = resolve_day(trading_day);
            let naive =
                NaiveDateTime::parse_from_str(&format!("{day} {text}"), "%Y%m%d %H%M%S").ok()?;
            return Some(hk_local_to_epoch_ms(naive, now_ms));
        }
        if text.len() == 14 {
            let naive = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S").ok()?;
            return Some(hk_local_to_epoch_ms(naive, now_ms));
        }
        let numeric: f64 = text.parse().ok()?;
        return Some(numeric_to_epoch_ms(numeric, now_ms));
    }

    // Aware forms carry their own offset; skip the HK attachment.
    if let Ok(aware) = DateTime::parse_from_rfc3339(&text.replace(' ', "T")) {
        return Some(normalize_epoch_ms(aware.timestamp_millis(), now_ms));
    }

    if text.contains('-') || text.contains('/') || text.contains(' ') || text.contains('T') {
        let cleaned = text.replace('T', " ");
        for fmt in [
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y/%m/%d %H:%M:%S%.f",
        ] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
                return Some(hk_local_to_epoch_ms(naive, now_ms));
            }
        }
        return None;
    }

    // time-only string (HH:MM:SS[.f]) resolved against the trading day
    let day = resolve_day(trading_day);
    let naive =
        NaiveDateTime::parse_from_str(&format!("{day} {text}"), "%Y%m%d %H:%M:%S%.f").ok()?;
    Some(hk_local_to_epoch_ms(naive, now_ms))
}

fn resolve_day(trading_day: Option<&str>) -> String {
    normalize_trading_day(trading_day).unwrap_or_else(today_trading_day)
}

fn hk_local_to_epoch_ms(naive: NaiveDateTime, now_ms: i64) -> i64 {
    let local = HK_TZ
        .from_local_datetime(&naive)
        .single()
        .or_else(|| HK_TZ.from_local_datetime(&naive).earliest());
    match local {
        Some(dt) => normalize_epoch_ms(dt.timestamp_millis(), now_ms),
        None => naive.and_utc().timestamp_millis() - HK_OFFSET_MS,
    }
}

/// ISO-8601 UTC rendering for log lines; `None` renders as `"none"`.
pub fn format_ts_ms_utc(ts_ms: Option<i64>) -> String {
    match ts_ms.and_then(|v| Utc.timestamp_millis_opt(v).single()) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_704_159_000_000; // 2024-01-02 09:30:00 UTC

    #[test]
    fn trading_day_uses_hk_calendar() {
        // 2024-01-01 23:00 UTC is already 2024-01-02 07:00 in Hong Kong.
        let ts = 1_704_150_000_000;
        assert_eq!(trading_day_from_ts(ts), "20240102");
    }

    #[test]
    fn future_ts_exactly_eight_hours_ahead_is_corrected() {
        let mislabeled = NOW + HK_OFFSET_MS;
        assert_eq!(normalize_epoch_ms(mislabeled, NOW), NOW);
    }

    #[test]
    fn future_ts_within_tolerance_is_corrected() {
        let mislabeled = NOW + HK_OFFSET_MS + 29 * 60 * 1000;
        assert_eq!(
            normalize_epoch_ms(mislabeled, NOW),
            mislabeled - HK_OFFSET_MS
        );
    }

    #[test]
    fn future_ts_outside_tolerance_passes_through() {
        let far_future = NOW + HK_OFFSET_MS + 31 * 60 * 1000;
        assert_eq!(normalize_epoch_ms(far_future, NOW), far_future);
    }

    #[test]
    fn near_future_under_guard_passes_through() {
        let near = NOW + FUTURE_GUARD_MS - 1;
        assert_eq!(normalize_epoch_ms(near, NOW), near);
    }

    #[test]
    fn parses_epoch_millis_and_seconds() {
        assert_eq!(
            parse_time_to_ts_ms(&json!(1_704_159_000_123_i64), None, NOW),
            Some(1_704_159_000_123)
        );
        assert_eq!(
            parse_time_to_ts_ms(&json!(1_704_159_000_i64), None, NOW),
            Some(1_704_159_000_000)
        );
    }

    #[test]
    fn parses_hk_datetime_text() {
        // 2024-01-02 17:30:00 HKT == 09:30:00 UTC
        let ts = parse_time_to_ts_ms(&json!("2024-01-02 17:30:00"), None, NOW).unwrap();
        assert_eq!(ts, NOW);
        let ts = parse_time_to_ts_ms(&json!("2024/01/02 17:30:00.000"), None, NOW).unwrap();
        assert_eq!(ts, NOW);
    }

    #[test]
    fn parses_compact_and_time_only_forms() {
        let ts = parse_time_to_ts_ms(&json!("20240102173000"), None, NOW).unwrap();
        assert_eq!(ts, NOW);
        let ts = parse_time_to_ts_ms(&json!("173000"), Some("20240102"), NOW).unwrap();
        assert_eq!(ts, NOW);
        let ts = parse_time_to_ts_ms(&json!("17:30:00"), Some("2024-01-02"), NOW).unwrap();
        assert_eq!(ts, NOW);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_time_to_ts_ms(&json!("not a time"), None, NOW), None);
        assert_eq!(parse_time_to_ts_ms(&json!(null), None, NOW), None);
    }

    #[test]
    fn normalizes_trading_day_separators() {
        assert_eq!(
            normalize_trading_day(Some("2024-01-02")).as_deref(),
            Some("20240102")
        );
        assert_eq!(
            normalize_trading_day(Some("2024/01/02")).as_deref(),
            Some("20240102")
        );
        assert_eq!(normalize_trading_day(Some("  ")), None);
        assert_eq!(normalize_trading_day(None), None);
    }
}
