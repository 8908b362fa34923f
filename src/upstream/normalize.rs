//! Raw gateway payload → `TickRow` normalization. Tolerant by design: a row
//! with an unparseable time or missing code is dropped with context, never
//! allowed to poison the batch.

use serde_json::Value;
use tracing::warn;

use crate::hk_time::{normalize_trading_day, now_ms, parse_time_to_ts_ms, trading_day_from_ts};
use crate::types::{PushType, TickRow};
use crate::upstream::messages::RawTick;

pub const PROVIDER: &str = "gateway";

/// Split a code into `(market, prefixed_symbol)`. Bare codes default to the
/// HK market and gain the prefix.
pub fn parse_market_symbol(code: &str) -> (String, String) {
    match code.split_once('.') {
        Some((market, _)) => (market.to_string(), code.to_string()),
        None => ("HK".to_string(), format!("HK.{code}")),
    }
}

fn to_f64(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn to_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn to_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let text = s.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map a batch of raw ticks into rows, stamping `recv_ts_ms` at ingress.
/// `inserted_at_ms` stays 0 and is stamped at first persistence attempt.
pub fn raw_ticks_to_rows(
    ticks: Vec<RawTick>,
    push_type: PushType,
    default_symbol: Option<&str>,
) -> Vec<TickRow> {
    let recv_ts_ms = now_ms();
    let mut rows = Vec::with_capacity(ticks.len());

    for tick in ticks {
        let code = tick
            .code
            .as_deref()
            .or(tick.symbol.as_deref())
            .or(default_symbol);
        let Some(code) = code else {
            warn!(push_type = %push_type, "missing code in ticker row, dropping");
            continue;
        };
        let (market, symbol) = parse_market_symbol(code);

        let day_hint = normalize_trading_day(tick.trading_day.as_deref())
            .or_else(|| normalize_trading_day(tick.date.as_deref()));

        let time_value = tick
            .time
            .as_ref()
            .or(tick.timestamp.as_ref())
            .or(tick.ts.as_ref());
        let ts_ms = time_value
            .and_then(|value| parse_time_to_ts_ms(value, day_hint.as_deref(), recv_ts_ms));
        let Some(ts_ms) = ts_ms else {
            warn!(
                symbol = %symbol,
                push_type = %push_type,
                time = ?time_value,
                "unparseable time in ticker row, dropping"
            );
            continue;
        };

        let trading_day = day_hint.unwrap_or_else(|| trading_day_from_ts(ts_ms));

        rows.push(TickRow {
            market,
            symbol,
            ts_ms,
            price: to_f64(tick.price.as_ref()),
            volume: to_i64(tick.volume.as_ref()),
            turnover: to_f64(tick.turnover.as_ref()),
            direction: to_text(tick.ticker_direction.as_ref())
                .or_else(|| to_text(tick.direction.as_ref())),
            seq: to_i64(tick.sequence.as_ref()).or_else(|| to_i64(tick.seq.as_ref())),
            tick_type: to_text(tick.tick_type.as_ref()),
            push_type,
            provider: Some(PROVIDER.to_string()),
            trading_day,
            recv_ts_ms,
            inserted_at_ms: 0,
        });
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(code: Option<&str>, time: Value) -> RawTick {
        RawTick {
            code: code.map(String::from),
            time: Some(time),
            ..RawTick::default()
        }
    }

    #[test]
    fn splits_and_prefixes_market_symbol() {
        assert_eq!(
            parse_market_symbol("HK.00700"),
            ("HK".to_string(), "HK.00700".to_string())
        );
        assert_eq!(
            parse_market_symbol("00700"),
            ("HK".to_string(), "HK.00700".to_string())
        );
        assert_eq!(
            parse_market_symbol("SH.600519"),
            ("SH".to_string(), "SH.600519".to_string())
        );
    }

    #[test]
    fn maps_full_row() {
        let mut tick = raw(Some("HK.00700"), json!(1_704_159_000_123_i64));
        tick.price = Some(json!(300.5));
        tick.volume = Some(json!("100"));
        tick.turnover = Some(json!(30_050.0));
        tick.ticker_direction = Some(json!("BUY"));
        tick.sequence = Some(json!(123));
        tick.tick_type = Some(json!("AUTO_MATCH"));

        let rows = raw_ticks_to_rows(vec![tick], PushType::Push, None);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.market, "HK");
        assert_eq!(row.symbol, "HK.00700");
        assert_eq!(row.ts_ms, 1_704_159_000_123);
        assert_eq!(row.price, Some(300.5));
        assert_eq!(row.volume, Some(100));
        assert_eq!(row.seq, Some(123));
        assert_eq!(row.direction.as_deref(), Some("BUY"));
        assert_eq!(row.push_type, PushType::Push);
        assert_eq!(row.provider.as_deref(), Some("gateway"));
        assert_eq!(row.trading_day, "20240102");
        assert!(row.recv_ts_ms > 0);
        assert_eq!(row.inserted_at_ms, 0);
    }

    #[test]
    fn missing_code_falls_back_to_default_symbol() {
        let rows = raw_ticks_to_rows(
            vec![raw(None, json!(1_704_159_000_000_i64))],
            PushType::Poll,
            Some("HK.00700"),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "HK.00700");
        assert_eq!(rows[0].push_type, PushType::Poll);
    }

    #[test]
    fn bad_rows_are_dropped_without_poisoning_the_batch() {
        let good = raw(Some("HK.00700"), json!(1_704_159_000_000_i64));
        let no_code = raw(None, json!(1_704_159_000_000_i64));
        let bad_time = raw(Some("HK.00005"), json!("not a time"));
        let rows = raw_ticks_to_rows(vec![no_code, good, bad_time], PushType::Push, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "HK.00700");
    }

    #[test]
    fn nan_numerics_become_null() {
        let mut tick = raw(Some("HK.00700"), json!(1_704_159_000_000_i64));
        tick.price = Some(json!("NaN"));
        tick.volume = Some(json!("abc"));
        let rows = raw_ticks_to_rows(vec![tick], PushType::Push, None);
        assert_eq!(rows[0].price, None);
        assert_eq!(rows[0].volume, None);
    }

    #[test]
    fn supplied_trading_day_wins_over_derived() {
        let mut tick = raw(Some("HK.00700"), json!("09:30:01"));
        tick.trading_day = Some("2024-01-02".to_string());
        let rows = raw_ticks_to_rows(vec![tick], PushType::Backfill, None);
        assert_eq!(rows[0].trading_day, "20240102");
    }
}
