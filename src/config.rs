use std::path::PathBuf;

use chrono_tz::Tz;

use crate::calendar::{parse_trading_sessions, TradingSession};
use crate::error::{AppError, Result};
use crate::hk_time::HK_TZ;

/// Default for `POLL_STALE_SEC`: skip polling a symbol when a push arrived
/// within this many seconds.
pub const POLL_SKIP_PUSH_SEC: f64 = 2.0;

/// Bound on the per-symbol recent-key set used to dedupe seq-less rows.
pub const POLL_RECENT_KEY_LIMIT: usize = 500;

/// Cadence of the client health log line / notifier snapshot.
pub const HEALTH_LOG_INTERVAL_SEC: u64 = 60;

/// Process exit code for watchdog-forced termination and worker fatal.
pub const WATCHDOG_EXIT_CODE: i32 = 2;

/// Capacity of the push-handler → dispatch handoff channel.
pub const HANDOFF_CHANNEL_CAPACITY: usize = 1024;

/// Telegram hard message size limit.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

pub const VALID_JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
pub const VALID_SYNCHRONOUS: &[&str] = &["OFF", "NORMAL", "FULL", "EXTRA"];

// ---------------------------------------------------------------------------
// Typed env parsing
// ---------------------------------------------------------------------------

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_str(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} is not a valid number: {value}"))),
        None => Ok(default),
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env_var(name)
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn env_list(name: &str) -> Vec<String> {
    env_var(name).map(|v| parse_list(&v)).unwrap_or_default()
}

pub fn parse_escalation_steps(value: &str) -> Result<Vec<u64>> {
    let mut steps = Vec::new();
    for item in parse_list(value) {
        let step: u64 = item.parse().map_err(|_| {
            AppError::Config(format!("invalid ALERT_ESCALATION_STEPS entry: {item}"))
        })?;
        steps.push(step);
    }
    steps.sort_unstable();
    steps.dedup();
    Ok(steps)
}

// ---------------------------------------------------------------------------
// Config groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub session: String,
    pub symbols: Vec<String>,
    pub reconnect_min_delay: u64,
    pub reconnect_max_delay: u64,
    pub backfill_n: usize,
    /// Gateway health probe cadence while Running.
    pub check_interval_sec: u64,
}

impl UpstreamConfig {
    /// `ws://host:port/quote` — the push stream endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/quote", self.host, self.port)
    }

    /// `http://host:port` — base for the poll/backfill/probe REST surface.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_root: PathBuf,
    pub journal_mode: String,
    pub synchronous: String,
    pub busy_timeout_ms: u64,
    /// 0 leaves the driver default in place.
    pub wal_autocheckpoint: u32,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub max_wait_ms: u64,
    pub max_queue_size: usize,
    /// 0 = never reset the attempt counter; >0 resets it (and thus backoff
    /// scaling) after that many attempts without ever dropping the batch.
    pub persist_retry_max_attempts: u32,
    pub persist_retry_backoff_sec: f64,
    pub persist_retry_backoff_max_sec: f64,
    pub heartbeat_interval_sec: u64,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub enabled: bool,
    pub interval_sec: u64,
    pub num: usize,
    /// Polling is skipped for a symbol whose last push is younger than this.
    pub stale_sec: f64,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub stall_sec: u64,
    pub upstream_window_sec: u64,
    pub queue_threshold_rows: usize,
    pub recovery_max_failures: u32,
    pub recovery_join_timeout_sec: f64,
    pub interval_sec: u64,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub gap_enabled: bool,
    pub gap_threshold_sec: f64,
    pub gap_active_window_sec: u64,
    pub gap_active_min_ticks: usize,
    pub gap_stall_warn_sec: f64,
    pub trading_tz: Tz,
    pub sessions: Vec<TradingSession>,
    pub holidays: Vec<String>,
    pub holiday_file: String,
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
    pub thread_id: Option<i64>,
    pub rate_limit_per_min: u32,
    pub alert_cooldown_sec: u64,
    pub alert_escalation_steps: Vec<u64>,
    pub health_trading_interval_sec: u64,
    pub health_offhours_interval_sec: u64,
    pub drift_warn_sec: u64,
    pub digest_queue_change_pct: f64,
    pub digest_last_tick_age_sec: f64,
    pub digest_drift_sec: f64,
    pub max_retries: u32,
    pub request_timeout_sec: f64,
    pub queue_maxsize: usize,
}

#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub poll: PollConfig,
    pub watchdog: WatchdogConfig,
    pub quality: QualityConfig,
    pub notifier: NotifierConfig,
    pub health: HealthServerConfig,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let symbols = env_list("SYMBOLS");
        if symbols.is_empty() {
            return Err(AppError::Config(
                "SYMBOLS is empty — set a comma-separated symbol list".to_string(),
            ));
        }

        let journal_mode = env_str("DB_JOURNAL_MODE", "WAL").trim().to_uppercase();
        if !VALID_JOURNAL_MODES.contains(&journal_mode.as_str()) {
            return Err(AppError::Config(format!(
                "DB_JOURNAL_MODE must be one of {VALID_JOURNAL_MODES:?}, got {journal_mode}"
            )));
        }
        let synchronous = env_str("DB_SYNCHRONOUS", "NORMAL").trim().to_uppercase();
        if !VALID_SYNCHRONOUS.contains(&synchronous.as_str()) {
            return Err(AppError::Config(format!(
                "DB_SYNCHRONOUS must be one of {VALID_SYNCHRONOUS:?}, got {synchronous}"
            )));
        }

        let trading_tz_text = env_str("TRADING_TZ", "Asia/Hong_Kong");
        let trading_tz: Tz = trading_tz_text.trim().parse().unwrap_or(HK_TZ);

        let sessions =
            parse_trading_sessions(&env_str("TRADING_SESSIONS", "09:30-12:00,13:00-16:00"))?;

        let escalation_steps =
            parse_escalation_steps(&env_str("ALERT_ESCALATION_STEPS", "0,600,1800"))?;

        let thread_id = match env_var("TELEGRAM_THREAD_ID") {
            Some(value) => Some(value.trim().parse::<i64>().map_err(|_| {
                AppError::Config(format!("TELEGRAM_THREAD_ID is not an integer: {value}"))
            })?),
            None => None,
        };

        Ok(Self {
            upstream: UpstreamConfig {
                host: env_str("GATEWAY_HOST", "127.0.0.1"),
                port: env_parse("GATEWAY_PORT", 11111u16)?,
                session: env_str("GATEWAY_SESSION", "all"),
                symbols,
                reconnect_min_delay: env_parse("RECONNECT_MIN_DELAY", 1u64)?.max(1),
                reconnect_max_delay: env_parse("RECONNECT_MAX_DELAY", 60u64)?,
                backfill_n: env_parse("BACKFILL_N", 0usize)?,
                check_interval_sec: env_parse("CHECK_INTERVAL_SEC", 5u64)?.max(1),
            },
            store: StoreConfig {
                data_root: PathBuf::from(env_str("DATA_ROOT", "./data/HK")),
                journal_mode,
                synchronous,
                busy_timeout_ms: env_parse("DB_BUSY_TIMEOUT_MS", 5000u64)?.max(1),
                wal_autocheckpoint: env_parse("DB_WAL_AUTOCHECKPOINT", 0u32)?,
            },
            queue: QueueConfig {
                batch_size: env_parse("BATCH_SIZE", 500usize)?.max(1),
                max_wait_ms: env_parse("MAX_WAIT_MS", 1000u64)?.max(1),
                max_queue_size: env_parse("MAX_QUEUE_SIZE", 20_000usize)?.max(1),
                persist_retry_max_attempts: env_parse("PERSIST_RETRY_MAX_ATTEMPTS", 0u32)?,
                persist_retry_backoff_sec: env_parse("PERSIST_RETRY_BACKOFF_SEC", 0.05f64)?
                    .max(0.01),
                persist_retry_backoff_max_sec: env_parse("PERSIST_RETRY_BACKOFF_MAX_SEC", 2.0f64)?
                    .max(0.01),
                heartbeat_interval_sec: env_parse("PERSIST_HEARTBEAT_INTERVAL_SEC", 30u64)?.max(1),
            },
            poll: PollConfig {
                enabled: env_bool("POLL_ENABLED", true),
                interval_sec: env_parse("POLL_INTERVAL_SEC", 3u64)?.max(1),
                num: env_parse("POLL_NUM", 100usize)?.max(1),
                stale_sec: env_parse("POLL_STALE_SEC", POLL_SKIP_PUSH_SEC)?.max(0.1),
            },
            watchdog: WatchdogConfig {
                stall_sec: env_parse("WATCHDOG_STALL_SEC", 180u64)?.max(1),
                upstream_window_sec: env_parse("WATCHDOG_UPSTREAM_WINDOW_SEC", 60u64)?.max(1),
                queue_threshold_rows: env_parse("WATCHDOG_QUEUE_THRESHOLD_ROWS", 1usize)?,
                recovery_max_failures: env_parse("WATCHDOG_RECOVERY_MAX_FAILURES", 3u32)?.max(1),
                recovery_join_timeout_sec: env_parse("WATCHDOG_RECOVERY_JOIN_TIMEOUT_SEC", 3.0f64)?
                    .max(0.1),
                interval_sec: env_parse("WATCHDOG_INTERVAL_SEC", 60u64)?.max(1),
            },
            quality: QualityConfig {
                gap_enabled: env_bool("GAP_ENABLED", true),
                gap_threshold_sec: env_parse("GAP_THRESHOLD_SEC", 10.0f64)?.max(0.1),
                gap_active_window_sec: env_parse("GAP_ACTIVE_WINDOW_SEC", 300u64)?.max(1),
                gap_active_min_ticks: env_parse("GAP_ACTIVE_MIN_TICKS", 50usize)?.max(1),
                gap_stall_warn_sec: env_parse("GAP_STALL_WARN_SEC", 30.0f64)?.max(0.1),
                trading_tz,
                sessions,
                holidays: env_list("HOLIDAYS"),
                holiday_file: env_str("HOLIDAY_FILE", ""),
            },
            notifier: NotifierConfig {
                enabled: env_bool("TELEGRAM_ENABLED", false),
                bot_token: env_str("TELEGRAM_BOT_TOKEN", ""),
                chat_id: env_str("TELEGRAM_CHAT_ID", ""),
                thread_id,
                rate_limit_per_min: env_parse("TELEGRAM_RATE_LIMIT_PER_MIN", 18u32)?.max(1),
                alert_cooldown_sec: env_parse("ALERT_COOLDOWN_SEC", 600u64)?.max(30),
                alert_escalation_steps: escalation_steps,
                health_trading_interval_sec: env_parse("HEALTH_TRADING_INTERVAL_SEC", 600u64)?
                    .max(30),
                health_offhours_interval_sec: env_parse("HEALTH_OFFHOURS_INTERVAL_SEC", 3600u64)?
                    .max(30),
                drift_warn_sec: env_parse("DRIFT_WARN_SEC", 120u64)?.max(1),
                digest_queue_change_pct: env_parse("DIGEST_QUEUE_CHANGE_PCT", 20.0f64)?.max(0.1),
                digest_last_tick_age_sec: env_parse("DIGEST_LAST_TICK_AGE_SEC", 60.0f64)?.max(1.0),
                digest_drift_sec: env_parse("DIGEST_DRIFT_SEC", 60.0f64)?.max(1.0),
                max_retries: env_parse("TELEGRAM_MAX_RETRIES", 4u32)?.max(1),
                request_timeout_sec: env_parse("TELEGRAM_REQUEST_TIMEOUT_SEC", 8.0f64)?.max(0.5),
                queue_maxsize: env_parse("TELEGRAM_QUEUE_MAXSIZE", 256usize)?.max(1),
            },
            health: HealthServerConfig {
                enabled: env_bool("HEALTH_ENABLED", true),
                host: env_str("HEALTH_HOST", "0.0.0.0"),
                port: env_parse("HEALTH_PORT", 8900u16)?,
            },
            log_level: env_str("LOG_LEVEL", "info"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_documented_forms() {
        for v in ["1", "true", "YES", "y", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["0", "false", "NO", "n", "Off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_list(" HK.00700, HK.00005 ,,HK.09988"),
            vec!["HK.00700", "HK.00005", "HK.09988"]
        );
        assert!(parse_list("  ,  ").is_empty());
    }

    #[test]
    fn escalation_steps_sorted_and_deduped() {
        let steps = parse_escalation_steps("1800,0,600,600").unwrap();
        assert_eq!(steps, vec![0, 600, 1800]);
        assert!(parse_escalation_steps("0,abc").is_err());
    }
}
