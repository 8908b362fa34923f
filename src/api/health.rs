//! Liveness endpoint. `GET /healthz` reports ingest freshness, queue depth
//! and connection state; always 200 so orchestration probes read the body.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

use crate::persist::PersistQueue;
use crate::upstream::UpstreamStats;

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<PersistQueue>,
    pub stats: Arc<UpstreamStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (p50, p95, p99) = state.queue.commit_latency.percentiles();
    Json(json!({
        "status": "ok",
        "last_tick_ts": state.stats.max_ts_ms_seen(),
        "queue_size": state.queue.queue_size(),
        "connected": state.stats.connected(),
        "state": state.stats.state().as_str(),
        "commit_latency_ms": { "p50": p50, "p95": p95, "p99": p99 },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{parse_trading_sessions, MarketCalendar, SessionCalendar};
    use crate::config::{QualityConfig, QueueConfig, StoreConfig};
    use crate::db::TickStore;
    use crate::hk_time::HK_TZ;
    use crate::quality::QualityReport;
    use crate::upstream::ConnectionState;

    fn state(root: &std::path::Path) -> ApiState {
        let store = TickStore::new(&StoreConfig {
            data_root: root.to_path_buf(),
            journal_mode: "WAL".into(),
            synchronous: "NORMAL".into(),
            busy_timeout_ms: 5000,
            wal_autocheckpoint: 0,
        });
        let quality = QualityConfig {
            gap_enabled: false,
            gap_threshold_sec: 10.0,
            gap_active_window_sec: 300,
            gap_active_min_ticks: 3,
            gap_stall_warn_sec: 5.0,
            trading_tz: HK_TZ,
            sessions: parse_trading_sessions("09:30-12:00,13:00-16:00").unwrap(),
            holidays: vec![],
            holiday_file: String::new(),
        };
        let calendar = SessionCalendar::new(
            quality.trading_tz,
            quality.sessions.clone(),
            MarketCalendar::default(),
        );
        let queue = PersistQueue::new(
            QueueConfig {
                batch_size: 100,
                max_wait_ms: 20,
                max_queue_size: 16,
                persist_retry_max_attempts: 0,
                persist_retry_backoff_sec: 0.05,
                persist_retry_backoff_max_sec: 2.0,
                heartbeat_interval_sec: 3600,
            },
            store,
            quality,
            calendar,
            Arc::new(QualityReport::new(root)),
        );
        ApiState {
            queue,
            stats: Arc::new(UpstreamStats::new()),
        }
    }

    #[tokio::test]
    async fn healthz_reports_pipeline_state() {
        let dir = tempfile::tempdir().unwrap();
        let api_state = state(dir.path());
        api_state.stats.set_state(ConnectionState::Running);

        let Json(body) = healthz(State(api_state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connected"], true);
        assert_eq!(body["state"], "running");
        assert_eq!(body["queue_size"], 0);
        assert!(body["last_tick_ts"].is_null());
    }
}
