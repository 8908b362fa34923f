//! Message rendering: primary lines (headline, conclusion, key metrics,
//! host/day/mode) plus a collapsible detail section. HTML mode targets the
//! Telegram `blockquote expandable` element; plain mode keeps only the
//! primary lines.

use crate::calendar::MarketMode;
use crate::config::TELEGRAM_MAX_MESSAGE_CHARS;
use crate::notify::types::{AlertEvent, HealthAssessment, HealthSnapshot, RenderedMessage, Severity};

const TRUNCATION_SUFFIX: &str = "\n... [truncated]";

fn severity_icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Ok => "\u{2705}",
        Severity::Warn => "\u{26a0}\u{fe0f}",
        Severity::Alert => "\u{1f6a8}",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn format_opt_f64(value: Option<f64>, digits: usize) -> String {
    match value {
        Some(v) => format!("{v:.digits$}"),
        None => "n/a".to_string(),
    }
}

fn format_opt_i64(value: Option<i64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "n/a".to_string(),
    }
}

pub struct MessageRenderer {
    parse_mode: String,
}

impl MessageRenderer {
    pub fn new(parse_mode: &str) -> Self {
        let mode = parse_mode.trim().to_uppercase();
        Self {
            parse_mode: if mode == "HTML" {
                "HTML".to_string()
            } else {
                String::new()
            },
        }
    }

    pub fn parse_mode(&self) -> &str {
        &self.parse_mode
    }

    pub fn render_health(
        &self,
        snapshot: &HealthSnapshot,
        assessment: &HealthAssessment,
        hostname: &str,
    ) -> RenderedMessage {
        if self.parse_mode != "HTML" {
            return self.render_health_plain(snapshot, assessment, hostname);
        }

        let icon = severity_icon(assessment.severity);
        let freshness = snapshot.drift_sec.map(f64::abs);

        let mut symbol_lines = Vec::new();
        let show_count = snapshot.symbols.len().min(3);
        for item in &snapshot.symbols[..show_count] {
            symbol_lines.push(format!(
                "- {}: age={}s, lag={}",
                item.symbol,
                format_opt_f64(item.last_tick_age_sec, 1),
                item.max_seq_lag
            ));
        }
        if snapshot.symbols.len() > show_count {
            symbol_lines.push(format!("- ... +{} symbols", snapshot.symbols.len() - show_count));
        }

        let mut primary_lines = vec![
            format!(
                "<b>{icon} HK Tick Collector \u{b7} HEALTH \u{b7} {}</b>",
                assessment.severity
            ),
            format!("Conclusion: {}", escape_html(&assessment.conclusion)),
            format!("Impact: {}", escape_html(&assessment.impact)),
            format!(
                "Key: freshness={}s, persisted/min={}, queue={}/{}",
                format_opt_f64(freshness, 1),
                snapshot.persisted_rows_per_min,
                snapshot.queue_size,
                snapshot.queue_maxsize
            ),
            format!(
                "Host: {} \u{b7} day={} \u{b7} mode={}",
                escape_html(hostname),
                escape_html(&snapshot.trading_day),
                assessment.market_mode
            ),
            "symbols:".to_string(),
        ];
        primary_lines.extend(symbol_lines.iter().map(|line| escape_html(line)));

        let mut detail_lines = vec![
            "tech:".to_string(),
            format!("db_path={}", snapshot.db_path.display()),
            format!(
                "db_rows={} max_ts_utc={}",
                snapshot.db_rows, snapshot.db_max_ts_utc
            ),
            format!(
                "push_per_min={} poll_fetched={} poll_accepted={} dup_drop={}",
                snapshot.push_rows_per_min,
                snapshot.poll_fetched,
                snapshot.poll_accepted,
                snapshot.dropped_duplicate
            ),
            "seq:".to_string(),
        ];
        for item in snapshot.symbols.iter().take(5) {
            detail_lines.push(format!(
                "{}: last_persisted_seq={} max_seq_lag={}",
                item.symbol,
                format_opt_i64(item.last_persisted_seq),
                item.max_seq_lag
            ));
        }
        detail_lines.push("suggest:".to_string());
        detail_lines.push("journalctl -u hktick-collector -n 120 --no-pager".to_string());
        detail_lines.push(format!(
            "sqlite3 {} 'select count(*), max(ts_ms) from ticks;'",
            snapshot.db_path.display()
        ));

        let mut text = primary_lines.join("\n");
        text.push('\n');
        text.push_str("<blockquote expandable>");
        text.push_str(&escape_html(&detail_lines.join("\n")));
        text.push_str("</blockquote>");
        RenderedMessage {
            text,
            parse_mode: self.parse_mode.clone(),
        }
    }

    pub fn render_alert(
        &self,
        event: &AlertEvent,
        hostname: &str,
        market_mode: MarketMode,
    ) -> RenderedMessage {
        if self.parse_mode != "HTML" {
            return self.render_alert_plain(event, hostname, market_mode);
        }

        let icon = severity_icon(event.severity);
        let headline = event
            .headline
            .clone()
            .unwrap_or_else(|| default_alert_headline(&event.code, event.severity));
        let impact = event
            .impact
            .clone()
            .unwrap_or_else(|| default_alert_impact(&event.code, event.severity));
        let action_line = if event.severity == Severity::Alert {
            "Action needed: yes"
        } else {
            "Action needed: watch"
        };
        let first_summary = event
            .summary_lines
            .first()
            .map(String::as_str)
            .unwrap_or("n/a");

        let primary_lines = vec![
            format!(
                "<b>{icon} HK Tick Collector \u{b7} {} \u{b7} {}</b>",
                escape_html(&event.code.to_uppercase()),
                event.severity
            ),
            format!("Conclusion: {}", escape_html(&headline)),
            format!("Impact: {}", escape_html(&impact)),
            action_line.to_string(),
            format!("Key: {}", escape_html(first_summary)),
            format!(
                "Host: {} \u{b7} day={} \u{b7} mode={}",
                escape_html(hostname),
                escape_html(&event.trading_day),
                market_mode
            ),
        ];

        let mut detail_lines = vec!["tech:".to_string()];
        detail_lines.extend(event.summary_lines.iter().cloned());
        detail_lines.push(format!("fingerprint={}", event.fingerprint()));
        if !event.suggestions.is_empty() {
            detail_lines.push("suggest:".to_string());
            detail_lines.extend(event.suggestions.iter().take(3).cloned());
        }

        let mut text = primary_lines.join("\n");
        text.push('\n');
        text.push_str("<blockquote expandable>");
        text.push_str(&escape_html(&detail_lines.join("\n")));
        text.push_str("</blockquote>");
        RenderedMessage {
            text,
            parse_mode: self.parse_mode.clone(),
        }
    }

    fn render_health_plain(
        &self,
        snapshot: &HealthSnapshot,
        assessment: &HealthAssessment,
        hostname: &str,
    ) -> RenderedMessage {
        let lines = vec![
            format!("HK Tick Collector HEALTH {}", assessment.severity),
            format!("Conclusion: {}", assessment.conclusion),
            format!("Impact: {}", assessment.impact),
            format!(
                "freshness={}s persisted/min={} queue={}/{}",
                format_opt_f64(snapshot.drift_sec, 1),
                snapshot.persisted_rows_per_min,
                snapshot.queue_size,
                snapshot.queue_maxsize
            ),
            format!(
                "host={} day={} mode={}",
                hostname, snapshot.trading_day, assessment.market_mode
            ),
        ];
        RenderedMessage {
            text: lines.join("\n"),
            parse_mode: String::new(),
        }
    }

    fn render_alert_plain(
        &self,
        event: &AlertEvent,
        hostname: &str,
        market_mode: MarketMode,
    ) -> RenderedMessage {
        let mut lines = vec![
            format!("HK Tick Collector {} {}", event.code, event.severity),
            format!("day={} mode={}", event.trading_day, market_mode),
            format!("host={hostname}"),
        ];
        lines.extend(event.summary_lines.iter().take(3).cloned());
        RenderedMessage {
            text: lines.join("\n"),
            parse_mode: String::new(),
        }
    }
}

fn default_alert_headline(code: &str, severity: Severity) -> String {
    match code.to_uppercase().as_str() {
        "PERSIST_STALL" => "Abnormal: persistence appears stalled".to_string(),
        "DISCONNECT" => "Attention: gateway connection lost, reconnecting".to_string(),
        _ if severity == Severity::Alert => {
            "Abnormal: an event requiring immediate handling was detected".to_string()
        }
        _ => "Attention: a risk event was detected".to_string(),
    }
}

fn default_alert_impact(code: &str, severity: Severity) -> String {
    match code.to_uppercase().as_str() {
        "PERSIST_STALL" => {
            "New rows may not reach the store; the timeline will fall behind".to_string()
        }
        "DISCONNECT" => {
            "Realtime completeness may suffer briefly; recovers after reconnect".to_string()
        }
        _ if severity == Severity::Alert => {
            "Data reliability may be affected; investigate immediately".to_string()
        }
        _ => "Degraded state; keep observing".to_string(),
    }
}

/// Clip a rendered message to the transport limit, sacrificing the detail
/// block first so the primary lines always survive.
pub fn truncate_rendered_message(message: &RenderedMessage, max_chars: usize) -> RenderedMessage {
    let limit = max_chars.max(1);
    if message.text.len() <= limit {
        return message.clone();
    }

    if message.parse_mode.eq_ignore_ascii_case("HTML") {
        const START_TAG: &str = "<blockquote expandable>";
        const END_TAG: &str = "</blockquote>";
        if let (Some(start_idx), Some(end_idx)) =
            (message.text.find(START_TAG), message.text.rfind(END_TAG))
        {
            if end_idx > start_idx {
                let head = &message.text[..start_idx];
                let detail = &message.text[start_idx + START_TAG.len()..end_idx];
                let tail = &message.text[end_idx + END_TAG.len()..];
                let overhead = head.len()
                    + START_TAG.len()
                    + END_TAG.len()
                    + tail.len()
                    + TRUNCATION_SUFFIX.len();
                if overhead < limit {
                    let keep = limit - overhead;
                    let clipped = clip_at_char_boundary(detail, keep);
                    return RenderedMessage {
                        text: format!(
                            "{head}{START_TAG}{clipped}{TRUNCATION_SUFFIX}{END_TAG}{tail}"
                        ),
                        parse_mode: message.parse_mode.clone(),
                    };
                }
            }
        }
    }

    let keep = limit.saturating_sub(TRUNCATION_SUFFIX.len());
    let clipped = clip_at_char_boundary(&message.text, keep);
    let mut text = format!("{clipped}{TRUNCATION_SUFFIX}");
    text.truncate(limit);
    RenderedMessage {
        text,
        parse_mode: message.parse_mode.clone(),
    }
}

fn clip_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Default clip for the Telegram transport.
pub fn truncate_for_telegram(message: &RenderedMessage) -> RenderedMessage {
    truncate_rendered_message(message, TELEGRAM_MAX_MESSAGE_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::types::SymbolSnapshot;
    use std::path::PathBuf;

    fn sample_snapshot() -> HealthSnapshot {
        HealthSnapshot {
            created_at_ms: 0,
            pid: 42,
            uptime_sec: 3600,
            trading_day: "20240102".into(),
            db_path: PathBuf::from("/data/HK/20240102.db"),
            db_rows: 12345,
            db_max_ts_utc: "2024-01-02T03:59:59.000Z".into(),
            drift_sec: Some(-2.5),
            queue_size: 10,
            queue_maxsize: 20000,
            push_rows_per_min: 120,
            poll_fetched: 30,
            poll_accepted: 2,
            persisted_rows_per_min: 118,
            dropped_duplicate: 28,
            symbols: vec![
                SymbolSnapshot {
                    symbol: "HK.00700".into(),
                    last_tick_age_sec: Some(1.2),
                    last_persisted_seq: Some(4567),
                    max_seq_lag: 0,
                },
                SymbolSnapshot {
                    symbol: "HK.00005".into(),
                    last_tick_age_sec: None,
                    last_persisted_seq: None,
                    max_seq_lag: 3,
                },
            ],
        }
    }

    fn sample_assessment(severity: Severity) -> HealthAssessment {
        HealthAssessment {
            severity,
            conclusion: "Normal: collection and persistence are steady".into(),
            impact: "No obvious risk".into(),
            needs_action: false,
            market_mode: MarketMode::Open,
        }
    }

    #[test]
    fn health_html_has_primary_and_detail_sections() {
        let renderer = MessageRenderer::new("HTML");
        let message = renderer.render_health(
            &sample_snapshot(),
            &sample_assessment(Severity::Ok),
            "collector-host",
        );
        assert_eq!(message.parse_mode, "HTML");
        assert!(message.text.contains("HEALTH \u{b7} OK"));
        assert!(message.text.contains("persisted/min=118"));
        assert!(message.text.contains("collector-host"));
        assert!(message.text.contains("<blockquote expandable>"));
        assert!(message.text.contains("db_rows=12345"));
        assert!(message.text.contains("HK.00700: last_persisted_seq=4567"));
    }

    #[test]
    fn plain_mode_skips_html() {
        let renderer = MessageRenderer::new("");
        let message = renderer.render_health(
            &sample_snapshot(),
            &sample_assessment(Severity::Warn),
            "host",
        );
        assert!(message.parse_mode.is_empty());
        assert!(!message.text.contains('<'));
        assert!(message.text.starts_with("HK Tick Collector HEALTH WARN"));
    }

    #[test]
    fn alert_renders_fingerprint_and_suggestions() {
        let renderer = MessageRenderer::new("HTML");
        let event = AlertEvent {
            created_at_ms: 0,
            code: "persist_stall".into(),
            severity: Severity::Alert,
            trading_day: "20240102".into(),
            summary_lines: vec!["persist_stall_sec=185.0".into(), "queue=500/20000".into()],
            suggestions: vec!["check disk space".into()],
            headline: None,
            impact: None,
            fingerprint: Some("PERSIST_STALL:20240102".into()),
        };
        let message = renderer.render_alert(&event, "host", MarketMode::Open);
        assert!(message.text.contains("PERSIST_STALL \u{b7} ALERT"));
        assert!(message.text.contains("Action needed: yes"));
        assert!(message.text.contains("fingerprint=PERSIST_STALL:20240102"));
        assert!(message.text.contains("check disk space"));
    }

    #[test]
    fn truncation_preserves_primary_lines() {
        let head = "<b>\u{1f6a8} HK Tick Collector \u{b7} HEALTH \u{b7} ALERT</b>\nConclusion: stalled\n";
        let detail: String = "x".repeat(10_000);
        let message = RenderedMessage {
            text: format!("{head}<blockquote expandable>{detail}</blockquote>"),
            parse_mode: "HTML".into(),
        };
        let clipped = truncate_rendered_message(&message, 4096);
        assert!(clipped.text.len() <= 4096);
        assert!(clipped.text.starts_with(head));
        assert!(clipped.text.contains("... [truncated]"));
        assert!(clipped.text.ends_with("</blockquote>"));
    }

    #[test]
    fn short_messages_pass_through_untouched() {
        let message = RenderedMessage {
            text: "short".into(),
            parse_mode: "HTML".into(),
        };
        assert_eq!(truncate_rendered_message(&message, 4096), message);
    }

    #[test]
    fn plain_truncation_appends_marker() {
        let message = RenderedMessage {
            text: "y".repeat(5000),
            parse_mode: String::new(),
        };
        let clipped = truncate_rendered_message(&message, 100);
        assert!(clipped.text.len() <= 100);
        assert!(clipped.text.contains("..."));
    }
}
