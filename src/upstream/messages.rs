//! Quote-gateway wire frames. The push stream delivers JSON objects over the
//! WebSocket; the poll/backfill REST surface returns bare arrays of the same
//! raw tick shape.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Raw tick object as the gateway emits it. Numeric fields arrive as either
/// JSON numbers or numeric strings depending on gateway version, so they are
/// kept as `Value` until normalization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTick {
    pub code: Option<String>,
    pub symbol: Option<String>,
    pub time: Option<Value>,
    pub timestamp: Option<Value>,
    pub ts: Option<Value>,
    pub price: Option<Value>,
    pub volume: Option<Value>,
    pub turnover: Option<Value>,
    pub direction: Option<Value>,
    pub ticker_direction: Option<Value>,
    pub sequence: Option<Value>,
    pub seq: Option<Value>,
    #[serde(rename = "type")]
    pub tick_type: Option<Value>,
    pub trading_day: Option<String>,
    pub date: Option<String>,
}

/// Raw deserializable shape covering all push-channel messages. Fields are
/// optional because different frame types carry different subsets.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    count: Option<u64>,
    data: Option<Vec<RawTick>>,
    message: Option<String>,
}

/// Parsed event from a single push frame.
#[derive(Debug)]
pub enum GatewayFrame {
    /// Subscription acknowledged for `count` symbols.
    Subscribed { count: u64 },
    /// Per-trade tick batch.
    Ticker(Vec<RawTick>),
    /// Gateway-reported error; the connection is considered unhealthy.
    Error(String),
}

/// Parse a raw WebSocket text frame. Unknown or malformed frames return
/// `None`; the first few are logged with a sample, then sampled at 1/1000.
pub fn parse_gateway_frame(raw: &str) -> Option<GatewayFrame> {
    let frame: RawFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => {
            let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
            if count <= 10 || count % 1000 == 0 {
                let sample = &raw[..500.min(raw.len())];
                warn!(count, "unrecognized gateway frame: {sample}");
            }
            return None;
        }
    };

    match frame.frame_type.as_deref() {
        Some("subscribed") => Some(GatewayFrame::Subscribed {
            count: frame.count.unwrap_or(0),
        }),
        Some("ticker") => Some(GatewayFrame::Ticker(frame.data.unwrap_or_default())),
        Some("error") => Some(GatewayFrame::Error(
            frame.message.unwrap_or_else(|| "unknown".to_string()),
        )),
        _ => None,
    }
}

/// Subscription request sent right after connect.
pub fn build_subscribe_msg(session: &str, symbols: &[String]) -> String {
    serde_json::json!({
        "type": "subscribe",
        "session": session,
        "symbols": symbols,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribed_ack() {
        let raw = r#"{"type":"subscribed","count":3}"#;
        match parse_gateway_frame(raw) {
            Some(GatewayFrame::Subscribed { count }) => assert_eq!(count, 3),
            other => panic!("expected Subscribed, got {other:?}"),
        }
    }

    #[test]
    fn parses_ticker_batch_with_mixed_field_types() {
        let raw = r#"{"type":"ticker","data":[
            {"code":"HK.00700","time":"2024-01-02 09:30:01","price":300.5,"volume":"100","turnover":30050.0,"sequence":123,"type":"AUTO_MATCH","ticker_direction":"BUY"},
            {"code":"HK.00005","time":1704159000,"price":"60.15","volume":400,"sequence":"456"}
        ]}"#;
        match parse_gateway_frame(raw) {
            Some(GatewayFrame::Ticker(ticks)) => {
                assert_eq!(ticks.len(), 2);
                assert_eq!(ticks[0].code.as_deref(), Some("HK.00700"));
                assert!(ticks[1].price.is_some());
            }
            other => panic!("expected Ticker, got {other:?}"),
        }
    }

    #[test]
    fn parses_error_frame() {
        let raw = r#"{"type":"error","message":"subscribe rejected"}"#;
        match parse_gateway_frame(raw) {
            Some(GatewayFrame::Error(message)) => assert_eq!(message, "subscribe rejected"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_returns_none() {
        assert!(parse_gateway_frame(r#"{"type":"heartbeat"}"#).is_none());
        assert!(parse_gateway_frame("not json").is_none());
    }

    #[test]
    fn subscribe_msg_shape() {
        let msg = build_subscribe_msg("all", &["HK.00700".to_string()]);
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "subscribe");
        assert_eq!(parsed["session"], "all");
        assert_eq!(parsed["symbols"][0], "HK.00700");
    }
}
