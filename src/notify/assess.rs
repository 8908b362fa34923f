//! Severity assessment, per-fingerprint deduplication with escalation
//! cadence, and the sliding-window send rate limiter. Everything here is
//! pure state over injected clocks so the cadence invariants are testable.

use std::collections::{HashMap, VecDeque};

use crate::calendar::MarketMode;
use crate::config::NotifierConfig;
use crate::notify::types::{HealthAssessment, HealthSnapshot, Severity};

// ---------------------------------------------------------------------------
// Sliding-window rate limiter
// ---------------------------------------------------------------------------

/// At most `limit` reservations per `window_sec`, measured over a sliding
/// window of send timestamps.
pub struct SlidingWindowRateLimiter {
    limit: usize,
    window_sec: f64,
    timestamps: VecDeque<f64>,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit_per_window: u32, window_sec: f64) -> Self {
        Self {
            limit: (limit_per_window as usize).max(1),
            window_sec: window_sec.max(1.0),
            timestamps: VecDeque::new(),
        }
    }

    pub fn limit_per_window(&self) -> usize {
        self.limit
    }

    /// Reserve a slot at `now` (monotonic seconds). Returns 0 when the send
    /// may proceed immediately, else the delay until the oldest reservation
    /// leaves the window.
    pub fn reserve_delay(&mut self, now: f64) -> f64 {
        while self
            .timestamps
            .front()
            .is_some_and(|t| (now - *t) >= self.window_sec)
        {
            self.timestamps.pop_front();
        }
        if self.timestamps.len() < self.limit {
            self.timestamps.push_back(now);
            return 0.0;
        }
        match self.timestamps.front() {
            Some(oldest) => (self.window_sec - (now - *oldest)).max(0.0),
            None => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-fingerprint dedupe with escalation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DedupeRecord {
    first_seen_at: f64,
    last_seen_at: f64,
    last_sent_at: f64,
    last_sent_severity: Severity,
    next_escalation_index: usize,
}

/// Decides whether a submission for a fingerprint is sent or suppressed:
/// new fingerprints and severity upgrades always send; afterwards sends
/// happen at escalation-step boundaries and then every cooldown.
#[derive(Default)]
pub struct DedupeStore {
    records: HashMap<String, DedupeRecord>,
}

impl DedupeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &mut self,
        fingerprint: &str,
        severity: Severity,
        now: f64,
        cooldown_sec: u64,
        escalation_steps: &[u64],
    ) -> (bool, String) {
        let key = if fingerprint.trim().is_empty() {
            "unknown"
        } else {
            fingerprint.trim()
        };
        let cooldown = cooldown_sec.max(1) as f64;

        let Some(record) = self.records.get_mut(key) else {
            let next_idx = escalation_steps
                .iter()
                .position(|step| *step > 0)
                .unwrap_or(escalation_steps.len());
            self.records.insert(
                key.to_string(),
                DedupeRecord {
                    first_seen_at: now,
                    last_seen_at: now,
                    last_sent_at: now,
                    last_sent_severity: severity,
                    next_escalation_index: next_idx,
                },
            );
            return (true, "new".to_string());
        };

        record.last_seen_at = now;

        if severity.rank() > record.last_sent_severity.rank() {
            record.last_sent_severity = severity;
            record.last_sent_at = now;
            return (true, "severity_upgraded".to_string());
        }

        let incident_age = (now - record.first_seen_at).max(0.0);
        if let Some(step) = escalation_steps.get(record.next_escalation_index) {
            if incident_age >= *step as f64 && (now - record.last_sent_at) >= 1.0 {
                record.next_escalation_index += 1;
                record.last_sent_at = now;
                return (true, format!("escalation_step_{step}s"));
            }
        }

        if (now - record.last_sent_at) >= cooldown {
            record.last_sent_at = now;
            return (true, "cooldown_elapsed".to_string());
        }

        (false, "cooldown_active".to_string())
    }

    /// Forget a fingerprint so the incident can re-alert from scratch.
    /// Returns whether it was known.
    pub fn resolve(&mut self, fingerprint: &str) -> bool {
        self.records.remove(fingerprint.trim()).is_some()
    }
}

// ---------------------------------------------------------------------------
// Health assessment state machine
// ---------------------------------------------------------------------------

pub struct AlertStateMachine {
    drift_warn_sec: f64,
    last_health_severity: Option<Severity>,
    last_health_sent_at: Option<f64>,
    last_persisted_rows_per_min: Option<u64>,
}

impl AlertStateMachine {
    pub fn new(drift_warn_sec: u64) -> Self {
        Self {
            drift_warn_sec: drift_warn_sec.max(1) as f64,
            last_health_severity: None,
            last_health_sent_at: None,
            last_persisted_rows_per_min: None,
        }
    }

    /// Severity rules: persisted==0 with backlog or lag during a trading
    /// session is an ALERT; drift beyond the warn threshold (trading modes
    /// only), queue utilisation >= 60%, or a collapse below 30% of the
    /// previous persist rate is a WARN. Off-session drift alone never raises
    /// above OK.
    pub fn assess_health(
        &mut self,
        snapshot: &HealthSnapshot,
        market_mode: MarketMode,
    ) -> HealthAssessment {
        let freshness_sec = snapshot.drift_sec.map(f64::abs);
        let queue_pct = snapshot.queue_utilization_pct();
        let persisted = snapshot.persisted_rows_per_min;
        let max_lag = snapshot.max_symbol_lag();

        let low_persist = match self.last_persisted_rows_per_min {
            Some(prev) if prev > 0 => {
                persisted > 0 && persisted < ((prev as f64) * 0.3).max(1.0) as u64
            }
            _ => false,
        };
        let drift_warn = market_mode.is_trading()
            && freshness_sec.is_some_and(|f| f >= self.drift_warn_sec);

        let (severity, conclusion, impact, needs_action) = if market_mode.is_trading()
            && persisted == 0
            && (snapshot.queue_size > 0 || max_lag > 0)
        {
            (
                Severity::Alert,
                "Abnormal: persistence appears stalled, act immediately",
                "New rows may stop reaching the store; delay and backlog can keep growing",
                true,
            )
        } else if drift_warn || queue_pct >= 60.0 || low_persist {
            (
                Severity::Warn,
                "Attention: service is running but quality indicators degraded",
                "Writes continue for now; delays or reduced throughput are possible",
                false,
            )
        } else {
            (
                Severity::Ok,
                "Normal: collection and persistence are steady",
                "No obvious risk; no operator action needed",
                false,
            )
        };

        self.last_persisted_rows_per_min = Some(persisted);
        HealthAssessment {
            severity,
            conclusion: conclusion.to_string(),
            impact: impact.to_string(),
            needs_action,
            market_mode,
        }
    }

    /// Health emission gate: first snapshot, severity changes, and cadence
    /// expiry send; everything else is suppressed.
    pub fn should_emit_health(
        &mut self,
        assessment: &HealthAssessment,
        now: f64,
        interval_sec: u64,
        meaningful_change: bool,
    ) -> (bool, &'static str) {
        let Some(last_severity) = self.last_health_severity else {
            self.last_health_severity = Some(assessment.severity);
            self.last_health_sent_at = Some(now);
            return (true, "bootstrap");
        };

        let state_changed = assessment.severity != last_severity;
        let cadence_elapsed = self
            .last_health_sent_at
            .map_or(true, |at| (now - at) >= interval_sec.max(1) as f64);

        if state_changed {
            self.last_health_severity = Some(assessment.severity);
            self.last_health_sent_at = Some(now);
            return (true, "state_changed");
        }
        if cadence_elapsed {
            self.last_health_severity = Some(assessment.severity);
            self.last_health_sent_at = Some(now);
            if meaningful_change {
                return (true, "cadence_with_change");
            }
            return (true, "cadence");
        }
        (false, "suppressed")
    }
}

/// Minimum spacing between equal-severity health sends per market mode.
pub fn health_interval_sec(mode: MarketMode, config: &NotifierConfig) -> u64 {
    match mode {
        MarketMode::Open => config.health_trading_interval_sec,
        MarketMode::PreOpen => config.health_trading_interval_sec * 3,
        MarketMode::LunchBreak | MarketMode::AfterHours => config.health_offhours_interval_sec,
        MarketMode::HolidayClosed => 86_400,
    }
}

// ---------------------------------------------------------------------------
// Digest change detection
// ---------------------------------------------------------------------------

/// Whether the new snapshot differs enough from the previous one to be worth
/// flagging on a cadence send.
pub fn has_significant_change(
    old: &HealthSnapshot,
    new: &HealthSnapshot,
    config: &NotifierConfig,
) -> bool {
    if (new.queue_utilization_pct() - old.queue_utilization_pct()).abs()
        >= config.digest_queue_change_pct
    {
        return true;
    }
    if crossed_threshold(
        old.max_symbol_age_sec(),
        new.max_symbol_age_sec(),
        config.digest_last_tick_age_sec,
        false,
    ) {
        return true;
    }
    if (old.persisted_rows_per_min > 0) != (new.persisted_rows_per_min > 0) {
        return true;
    }
    crossed_threshold(old.drift_sec, new.drift_sec, config.digest_drift_sec, true)
}

fn crossed_threshold(
    before: Option<f64>,
    after: Option<f64>,
    threshold: f64,
    use_abs: bool,
) -> bool {
    let norm = |v: f64| if use_abs { v.abs() } else { v };
    match (before, after) {
        (None, None) => false,
        (None, Some(after)) => norm(after) >= threshold,
        (Some(_), None) => false,
        (Some(before), Some(after)) => {
            let (lhs, rhs) = (norm(before), norm(after));
            (lhs < threshold && threshold <= rhs) || (lhs >= threshold && threshold > rhs)
        }
    }
}
