mod api;
mod calendar;
mod config;
mod db;
mod error;
mod hk_time;
mod notify;
mod persist;
mod quality;
mod types;
mod upstream;
mod watchdog;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::calendar::{MarketCalendar, SessionCalendar};
use crate::config::{Config, WATCHDOG_EXIT_CODE};
use crate::db::store::recent_trading_days;
use crate::db::TickStore;
use crate::error::Result;
use crate::hk_time::today_trading_day;
use crate::notify::Notifier;
use crate::persist::PersistQueue;
use crate::quality::QualityReport;
use crate::upstream::{ClientHandle, UpstreamClient, UpstreamStats};
use crate::watchdog::{Watchdog, WatchdogOutcome};

/// How many recent daily shards the startup seq seed may open.
const SEED_MAX_DB_FILES: usize = 3;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Config error: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    let code = match run(cfg).await {
        Ok(code) => code,
        Err(err) => {
            error!("Fatal error: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cfg: Config) -> Result<i32> {
    // --- Store setup ---
    let store = TickStore::new(&cfg.store);
    let trading_day = today_trading_day();
    let db_path = store.ensure_db(&trading_day).await?;
    info!("store ready at {}", db_path.display());

    // Seed seq baselines from recent shards so polling suppresses rows that
    // already landed before the restart.
    let recent_days = recent_trading_days(SEED_MAX_DB_FILES + 2);
    let seed = match store
        .fetch_max_seq_by_symbol_recent(&cfg.upstream.symbols, &recent_days, SEED_MAX_DB_FILES)
        .await
    {
        Ok(seed) => seed,
        Err(err) => {
            warn!(error = %err, "seed_last_seq_failed");
            Default::default()
        }
    };
    if seed.is_empty() {
        info!(trading_day = %trading_day, "seed_last_seq values=none");
    } else {
        info!(trading_day = %trading_day, values = ?seed, "seed_last_seq");
    }

    let calendar = MarketCalendar::new(&cfg.quality.holidays, &cfg.quality.holiday_file);
    let session_calendar = SessionCalendar::new(
        cfg.quality.trading_tz,
        cfg.quality.sessions.clone(),
        calendar.clone(),
    );
    let report = Arc::new(QualityReport::new(store.data_root()));

    // --- Queue + worker ---
    let queue = PersistQueue::new(
        cfg.queue.clone(),
        store.clone(),
        cfg.quality.clone(),
        session_calendar,
        report,
    );

    let stats = Arc::new(UpstreamStats::new());
    stats.seed_persisted_seq(&seed);

    // Commit results flow back into the client's dedupe baselines through
    // the persist observer, in commit order.
    let observer_stats = Arc::clone(&stats);
    queue.set_persist_observer(Some(Arc::new(
        move |rows: &[types::TickRow], _result: &db::PersistResult| {
            observer_stats.record_persist_result(rows);
        },
    )));

    queue.start().await;

    // --- Upstream client ---
    let notifier = Notifier::new(cfg.notifier.clone(), calendar.clone());
    let client_handle = ClientHandle::new();
    let client = UpstreamClient::new(
        cfg.upstream.clone(),
        cfg.poll.clone(),
        cfg.notifier.drift_warn_sec,
        store.clone(),
        Arc::clone(&queue),
        Arc::clone(&stats),
        Arc::clone(&notifier),
        Arc::clone(&client_handle),
    );
    let mut client_task = tokio::spawn(client.run());

    // --- Notifier ---
    notifier.start().await;

    // --- Watchdog ---
    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let watchdog = Watchdog::new(
        cfg.watchdog.clone(),
        Arc::clone(&queue),
        Arc::clone(&stats),
        Arc::clone(&notifier),
        Arc::clone(&watchdog_stop),
    );
    let mut watchdog_task = tokio::spawn(watchdog.run());

    // --- Health server ---
    let health_task = if cfg.health.enabled {
        let app = api::router(ApiState {
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
        });
        let bind_addr = format!("{}:{}", cfg.health.host, cfg.health.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!("health server listening on {bind_addr}");
        Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!("health server error: {err}");
            }
        }))
    } else {
        None
    };

    // --- Wait for shutdown, worker fatal, or watchdog exit ---
    let mut exit_code = 0;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        _ = queue.wait_fatal() => {
            error!("persist worker fatal, shutting down");
            exit_code = WATCHDOG_EXIT_CODE;
        }
        outcome = &mut watchdog_task => {
            if matches!(outcome, Ok(WatchdogOutcome::Exit)) {
                error!("watchdog forced exit");
                exit_code = WATCHDOG_EXIT_CODE;
            } else {
                warn!("watchdog task ended unexpectedly");
            }
        }
    }

    // --- Reverse-order teardown with bounded timeouts ---
    if let Some(handle) = health_task {
        handle.abort();
    }

    watchdog_stop.store(true, Ordering::SeqCst);
    watchdog_task.abort();

    client_handle.request_stop();
    if tokio::time::timeout(Duration::from_secs(12), &mut client_task)
        .await
        .is_err()
    {
        warn!("client shutdown timeout, cancelling");
        client_task.abort();
        let _ = client_task.await;
    }

    notifier.stop().await;

    if let Err(err) = queue.stop(Duration::from_secs(60), true).await {
        error!("collector shutdown error: {err}");
        if exit_code == 0 {
            exit_code = WATCHDOG_EXIT_CODE;
        }
    }

    Ok(exit_code)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
