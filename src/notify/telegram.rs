//! Telegram delivery: severity assessment and dedupe on submission, then a
//! bounded in-process queue drained by a single worker under a sliding-window
//! rate limit. 429 honours `retry_after`; transient failures back off
//! exponentially capped at 8s; permanent failures are logged with the token
//! masked and discarded.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::calendar::{resolve_market_mode, MarketCalendar};
use crate::config::NotifierConfig;
use crate::db::store::hostname;
use crate::hk_time::now_ms;
use crate::notify::assess::{
    has_significant_change, health_interval_sec, AlertStateMachine, DedupeStore,
    SlidingWindowRateLimiter,
};
use crate::notify::render::{truncate_for_telegram, MessageRenderer};
use crate::notify::types::{
    AlertEvent, HealthSnapshot, OutboundMessage, RenderedMessage, SendResult, Severity,
};

/// One message handed to the transport.
#[derive(Debug, Clone)]
pub struct SendPayload {
    pub chat_id: String,
    pub text: String,
    pub parse_mode: String,
    pub thread_id: Option<i64>,
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    async fn send(&self, payload: &SendPayload) -> SendResult;
}

// ---------------------------------------------------------------------------
// Telegram Bot API client
// ---------------------------------------------------------------------------

pub struct TelegramClient {
    bot_token: String,
    masked_token: String,
    http: reqwest::Client,
}

impl TelegramClient {
    pub fn new(bot_token: &str, request_timeout_sec: f64) -> Self {
        let token = bot_token.trim().to_string();
        let masked_token = mask_secret(&token);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(request_timeout_sec.max(0.5)))
            .build()
            .unwrap_or_default();
        Self {
            bot_token: token,
            masked_token,
            http,
        }
    }

    pub fn masked_token(&self) -> &str {
        &self.masked_token
    }

    fn sanitize(&self, text: &str) -> String {
        if self.bot_token.is_empty() {
            return text.to_string();
        }
        text.replace(&self.bot_token, &self.masked_token)
    }

    fn parse_send_response(&self, status_code: u16, body: &str) -> SendResult {
        let payload: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let retry_after = payload
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64);

        let ok_flag = payload
            .get("ok")
            .and_then(Value::as_bool)
            .unwrap_or((200..300).contains(&status_code));
        let success = ok_flag && (200..300).contains(&status_code);
        let error = payload
            .get("description")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| (!success).then(|| format!("http_{status_code}")));

        SendResult {
            ok: success,
            status_code,
            retry_after,
            error: error.map(|e| self.sanitize(&e)),
        }
    }
}

#[async_trait]
impl SendTransport for TelegramClient {
    async fn send(&self, payload: &SendPayload) -> SendResult {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let mut form = vec![
            ("chat_id".to_string(), payload.chat_id.clone()),
            ("text".to_string(), payload.text.clone()),
            ("disable_web_page_preview".to_string(), "true".to_string()),
        ];
        if !payload.parse_mode.is_empty() {
            form.push(("parse_mode".to_string(), payload.parse_mode.clone()));
        }
        if let Some(thread_id) = payload.thread_id {
            form.push(("message_thread_id".to_string(), thread_id.to_string()));
        }

        match self.http.post(&url).form(&form).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                self.parse_send_response(status, &body)
            }
            Err(err) => SendResult {
                ok: false,
                status_code: 0,
                retry_after: None,
                error: Some(self.sanitize(&err.to_string())),
            },
        }
    }
}

fn mask_secret(secret: &str) -> String {
    let text = secret.trim();
    if text.is_empty() {
        return "none".to_string();
    }
    if text.len() <= 8 {
        return "*".repeat(text.len());
    }
    format!("{}...{}", &text[..4], &text[text.len() - 4..])
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

struct NotifyState {
    state_machine: AlertStateMachine,
    dedupe: DedupeStore,
    last_snapshot: Option<HealthSnapshot>,
}

pub struct Notifier {
    active: bool,
    config: NotifierConfig,
    calendar: MarketCalendar,
    renderer: MessageRenderer,
    hostname: String,
    masked_token: String,
    epoch: Instant,

    state: Mutex<NotifyState>,
    tx: mpsc::Sender<Option<OutboundMessage>>,
    rx: Mutex<Option<mpsc::Receiver<Option<OutboundMessage>>>>,
    transport: Arc<dyn SendTransport>,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(config: NotifierConfig, calendar: MarketCalendar) -> Arc<Self> {
        let transport: Arc<dyn SendTransport> = Arc::new(TelegramClient::new(
            &config.bot_token,
            config.request_timeout_sec,
        ));
        Self::with_transport(config, calendar, transport)
    }

    pub fn with_transport(
        config: NotifierConfig,
        calendar: MarketCalendar,
        transport: Arc<dyn SendTransport>,
    ) -> Arc<Self> {
        let active =
            config.enabled && !config.chat_id.trim().is_empty() && !config.bot_token.trim().is_empty();
        let masked_token = mask_secret(&config.bot_token);
        if config.enabled && !active {
            let chat_id = if config.chat_id.is_empty() {
                "none"
            } else {
                config.chat_id.as_str()
            };
            warn!(
                chat_id = %chat_id,
                token = %masked_token,
                "telegram_notifier_disabled_missing_config"
            );
        }

        let (tx, rx) = mpsc::channel(config.queue_maxsize.max(1));
        Arc::new(Self {
            active,
            renderer: MessageRenderer::new("HTML"),
            hostname: hostname(),
            masked_token,
            epoch: Instant::now(),
            state: Mutex::new(NotifyState {
                state_machine: AlertStateMachine::new(config.drift_warn_sec),
                dedupe: DedupeStore::new(),
                last_snapshot: None,
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            transport,
            worker: AsyncMutex::new(None),
            calendar,
            config,
        })
    }

    pub fn active(&self) -> bool {
        self.active
    }

    fn now_sec(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub async fn start(self: &Arc<Self>) {
        if !self.active {
            return;
        }
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let rx = self.rx.lock().ok().and_then(|mut slot| slot.take());
        let Some(rx) = rx else {
            return;
        };
        info!(
            chat_id = %self.config.chat_id,
            thread_id = self.config.thread_id.unwrap_or(-1),
            token = %self.masked_token,
            rate_limit_per_min = self.config.rate_limit_per_min,
            "telegram_notifier_started"
        );
        let notifier = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { notifier.worker_loop(rx).await }));
    }

    pub async fn stop(&self) {
        let handle = self.worker.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.tx.send(None).await;
        if tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .is_err()
        {
            error!("telegram_notifier_stop_timeout");
        }
    }

    /// Assess a health snapshot and enqueue a message when the state machine
    /// and per-mode cadence allow it.
    pub fn submit_health(&self, snapshot: HealthSnapshot) {
        if !self.active {
            return;
        }
        let now = self.now_sec();
        let mode = resolve_market_mode(now_ms(), &self.calendar);

        let (should_send, reason, rendered, severity, fingerprint) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let assessment = state.state_machine.assess_health(&snapshot, mode);
            let interval_sec = health_interval_sec(mode, &self.config);
            let meaningful_change = state
                .last_snapshot
                .as_ref()
                .map_or(true, |old| has_significant_change(old, &snapshot, &self.config));
            let (should_send, reason) = state.state_machine.should_emit_health(
                &assessment,
                now,
                interval_sec,
                meaningful_change,
            );
            let rendered = should_send.then(|| {
                self.renderer
                    .render_health(&snapshot, &assessment, &self.hostname)
            });
            let severity = assessment.severity;
            let fingerprint = format!("HEALTH:{mode}");
            state.last_snapshot = Some(snapshot);
            (should_send, reason, rendered, severity, fingerprint)
        };

        match rendered {
            Some(rendered) if should_send => {
                self.enqueue_message("HEALTH", rendered, severity, &fingerprint, reason);
            }
            _ => {
                info!(
                    reason,
                    severity = %severity,
                    mode = %mode,
                    "telegram_health_suppressed"
                );
            }
        }
    }

    /// Deduplicate and enqueue a discrete alert event.
    pub fn submit_alert(&self, event: AlertEvent) {
        if !self.active {
            return;
        }
        let now = self.now_sec();
        let fingerprint = event.fingerprint();

        let decision = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.dedupe.evaluate(
                &fingerprint,
                event.severity,
                now,
                self.config.alert_cooldown_sec,
                &self.config.alert_escalation_steps,
            )
        };
        let (should_send, reason) = decision;
        if !should_send {
            info!(
                code = %event.code,
                fingerprint = %fingerprint,
                reason = %reason,
                cooldown_sec = self.config.alert_cooldown_sec,
                "telegram_alert_suppressed"
            );
            return;
        }

        let mode = resolve_market_mode(now_ms(), &self.calendar);
        let rendered = self.renderer.render_alert(&event, &self.hostname, mode);
        self.enqueue_message(&event.code, rendered, event.severity, &fingerprint, &reason);
    }

    /// Emit a recovery message for a previously alerted fingerprint and
    /// forget it so the incident can re-alert from scratch.
    pub fn resolve_alert(
        &self,
        code: &str,
        trading_day: &str,
        fingerprint: Option<&str>,
        summary_lines: Vec<String>,
    ) {
        if !self.active {
            return;
        }
        let fingerprint =
            fingerprint.map(String::from).unwrap_or_else(|| format!("{code}:{trading_day}"));

        let was_known = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.dedupe.resolve(&fingerprint)
        };
        if !was_known {
            return;
        }

        let mode = resolve_market_mode(now_ms(), &self.calendar);
        let event = AlertEvent {
            created_at_ms: now_ms(),
            code: format!("{code}_RESOLVED"),
            severity: Severity::Ok,
            trading_day: trading_day.to_string(),
            summary_lines,
            suggestions: vec![],
            headline: Some("Recovered: the incident condition has cleared".to_string()),
            impact: Some("Collection and persistence resumed".to_string()),
            fingerprint: Some(format!("{fingerprint}:resolved")),
        };
        let rendered = self.renderer.render_alert(&event, &self.hostname, mode);
        self.enqueue_message(&event.code, rendered, Severity::Ok, &fingerprint, "resolved");
    }

    fn enqueue_message(
        &self,
        kind: &str,
        message: RenderedMessage,
        severity: Severity,
        fingerprint: &str,
        reason: &str,
    ) -> bool {
        let clipped = truncate_for_telegram(&message);
        let payload = OutboundMessage {
            kind: kind.to_string(),
            message: clipped,
            severity,
            fingerprint: fingerprint.to_string(),
        };
        match self.tx.try_send(Some(payload)) {
            Ok(()) => {
                info!(
                    kind,
                    severity = %severity,
                    fingerprint,
                    reason,
                    "telegram_enqueue"
                );
                true
            }
            Err(_) => {
                error!(
                    kind,
                    severity = %severity,
                    fingerprint,
                    dropped = 1,
                    "telegram_queue_full"
                );
                false
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Option<OutboundMessage>>) {
        let mut limiter =
            SlidingWindowRateLimiter::new(self.config.rate_limit_per_min, 60.0);
        while let Some(item) = rx.recv().await {
            let Some(payload) = item else {
                return;
            };
            self.deliver(&mut limiter, &payload).await;
        }
    }

    async fn deliver(&self, limiter: &mut SlidingWindowRateLimiter, payload: &OutboundMessage) {
        let request = SendPayload {
            chat_id: self.config.chat_id.clone(),
            text: payload.message.text.clone(),
            parse_mode: payload.message.parse_mode.clone(),
            thread_id: self.config.thread_id,
        };

        for attempt in 1..=self.config.max_retries {
            loop {
                let delay = limiter.reserve_delay(self.now_sec());
                if delay <= 0.0 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }

            let result = self.transport.send(&request).await;
            if result.ok {
                info!(
                    kind = %payload.kind,
                    severity = %payload.severity,
                    fingerprint = %payload.fingerprint,
                    attempt,
                    "telegram_send_ok"
                );
                return;
            }

            if result.status_code == 429 {
                if let (Some(retry_after), true) =
                    (result.retry_after, attempt < self.config.max_retries)
                {
                    warn!(
                        kind = %payload.kind,
                        severity = %payload.severity,
                        fingerprint = %payload.fingerprint,
                        retry_after,
                        attempt,
                        "telegram_rate_limited"
                    );
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                    continue;
                }
            }

            if attempt >= self.config.max_retries {
                error!(
                    kind = %payload.kind,
                    severity = %payload.severity,
                    fingerprint = %payload.fingerprint,
                    status = result.status_code,
                    error = %result.error.as_deref().unwrap_or("unknown"),
                    attempts = attempt,
                    token = %self.masked_token,
                    "telegram_send_failed"
                );
                return;
            }

            let backoff = Duration::from_secs_f64((2f64.powi(attempt as i32 - 1)).min(8.0));
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockTransport {
        sent: Mutex<Vec<SendPayload>>,
        script: Mutex<Vec<SendResult>>,
        calls: AtomicUsize,
    }

    impl MockTransport {
        fn new(script: Vec<SendResult>) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|p| p.text.clone()).collect()
        }
    }

    #[async_trait]
    impl SendTransport for MockTransport {
        async fn send(&self, payload: &SendPayload) -> SendResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(payload.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                SendResult::success()
            } else {
                script.remove(0)
            }
        }
    }

    fn config(enabled: bool) -> NotifierConfig {
        NotifierConfig {
            enabled,
            bot_token: "123456789:TESTTOKENVALUE".into(),
            chat_id: "-100200300".into(),
            thread_id: Some(7),
            rate_limit_per_min: 18,
            alert_cooldown_sec: 600,
            alert_escalation_steps: vec![0, 600, 1800],
            health_trading_interval_sec: 600,
            health_offhours_interval_sec: 3600,
            drift_warn_sec: 120,
            digest_queue_change_pct: 20.0,
            digest_last_tick_age_sec: 60.0,
            digest_drift_sec: 60.0,
            max_retries: 4,
            request_timeout_sec: 8.0,
            queue_maxsize: 16,
        }
    }

    fn alert(code: &str, severity: Severity) -> AlertEvent {
        AlertEvent {
            created_at_ms: now_ms(),
            code: code.into(),
            severity,
            trading_day: "20240102".into(),
            summary_lines: vec!["queue=10/100".into()],
            suggestions: vec![],
            headline: None,
            impact: None,
            fingerprint: None,
        }
    }

    async fn wait_for_sends(transport: &MockTransport, n: usize) {
        for _ in 0..200 {
            if transport.calls.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn masks_tokens() {
        assert_eq!(mask_secret(""), "none");
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret("123456789:TESTTOKENVALUE"), "1234...ALUE");
    }

    #[test]
    fn parses_429_with_retry_after() {
        let client = TelegramClient::new("123456789:TESTTOKENVALUE", 1.0);
        let result = client.parse_send_response(
            429,
            r#"{"ok":false,"description":"Too Many Requests","parameters":{"retry_after":17}}"#,
        );
        assert!(!result.ok);
        assert_eq!(result.status_code, 429);
        assert_eq!(result.retry_after, Some(17));
        assert_eq!(result.error.as_deref(), Some("Too Many Requests"));
    }

    #[test]
    fn sanitizes_token_in_errors() {
        let client = TelegramClient::new("123456789:TESTTOKENVALUE", 1.0);
        let result = client.parse_send_response(
            404,
            r#"{"ok":false,"description":"Not Found: 123456789:TESTTOKENVALUE"}"#,
        );
        assert!(!result.ok);
        assert!(!result.error.as_deref().unwrap().contains("TESTTOKENVALUE"));
        assert!(result.error.as_deref().unwrap().contains("1234...ALUE"));
    }

    #[test]
    fn disabled_without_token_or_chat() {
        let mut cfg = config(true);
        cfg.chat_id = String::new();
        let notifier = Notifier::with_transport(
            cfg,
            MarketCalendar::default(),
            MockTransport::new(vec![]),
        );
        assert!(!notifier.active());
    }

    #[tokio::test]
    async fn delivers_alert_through_transport() {
        let transport = MockTransport::new(vec![]);
        let notifier = Notifier::with_transport(
            config(true),
            MarketCalendar::default(),
            Arc::clone(&transport) as Arc<dyn SendTransport>,
        );
        notifier.start().await;

        notifier.submit_alert(alert("PERSIST_STALL", Severity::Alert));
        wait_for_sends(&transport, 1).await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "-100200300");
        assert_eq!(sent[0].thread_id, Some(7));
        assert!(sent[0].text.contains("PERSIST_STALL"));
        notifier.stop().await;
    }

    #[tokio::test]
    async fn duplicate_alert_suppressed_within_cooldown() {
        let transport = MockTransport::new(vec![]);
        let notifier = Notifier::with_transport(
            config(true),
            MarketCalendar::default(),
            Arc::clone(&transport) as Arc<dyn SendTransport>,
        );
        notifier.start().await;

        notifier.submit_alert(alert("DISCONNECT", Severity::Warn));
        notifier.submit_alert(alert("DISCONNECT", Severity::Warn));
        wait_for_sends(&transport, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // Severity upgrade breaks through.
        notifier.submit_alert(alert("DISCONNECT", Severity::Alert));
        wait_for_sends(&transport, 2).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn retry_after_is_honoured_then_send_succeeds() {
        let transport = MockTransport::new(vec![SendResult {
            ok: false,
            status_code: 429,
            retry_after: Some(0),
            error: Some("Too Many Requests".into()),
        }]);
        let notifier = Notifier::with_transport(
            config(true),
            MarketCalendar::default(),
            Arc::clone(&transport) as Arc<dyn SendTransport>,
        );
        notifier.start().await;

        notifier.submit_alert(alert("PERSIST_STALL", Severity::Alert));
        wait_for_sends(&transport, 2).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.sent_texts().len(), 2);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn resolve_emits_recovery_once() {
        let transport = MockTransport::new(vec![]);
        let notifier = Notifier::with_transport(
            config(true),
            MarketCalendar::default(),
            Arc::clone(&transport) as Arc<dyn SendTransport>,
        );
        notifier.start().await;

        notifier.submit_alert(alert("PERSIST_STALL", Severity::Alert));
        wait_for_sends(&transport, 1).await;

        notifier.resolve_alert("PERSIST_STALL", "20240102", None, vec!["commits resumed".into()]);
        wait_for_sends(&transport, 2).await;
        let texts = transport.sent_texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[1].contains("PERSIST_STALL_RESOLVED"));

        // Unknown fingerprint resolves to nothing.
        notifier.resolve_alert("PERSIST_STALL", "20240102", None, vec![]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        notifier.stop().await;
    }
}
