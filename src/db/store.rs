//! Daily-sharded tick persistence. One SQLite file per trading day under
//! `data_root`; a `TickWriter` is owned by exactly one persist worker and
//! caches one open connection per day.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Days;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::db::schema::{
    ensure_schema, INSERT_GAP_SQL, INSERT_TICK_SQL, UPSERT_DAILY_QUALITY_SQL,
};
use crate::error::Result;
use crate::hk_time::{now_ms, HK_TZ};
use crate::quality::{GapDetector, QualityReport};
use crate::types::TickRow;

/// Outcome of one idempotent batch insert.
#[derive(Debug, Clone)]
pub struct PersistResult {
    pub db_path: PathBuf,
    pub batch: usize,
    pub inserted: u64,
    /// Rows the dedupe indexes rejected.
    pub ignored: u64,
    pub commit_latency_ms: u64,
}

pub fn db_path_for_trading_day(data_root: &Path, trading_day: &str) -> PathBuf {
    data_root.join(format!("{trading_day}.db"))
}

/// The most recent `n` HK trading-day keys (today first). Used to bound the
/// startup seq-seed scan.
pub fn recent_trading_days(n: usize) -> Vec<String> {
    let today = chrono::Utc::now().with_timezone(&HK_TZ).date_naive();
    (0..n as u64)
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .map(|d| d.format("%Y%m%d").to_string())
        .collect()
}

fn sanitize_journal_mode(value: &str) -> SqliteJournalMode {
    match value.trim().to_uppercase().as_str() {
        "DELETE" => SqliteJournalMode::Delete,
        "TRUNCATE" => SqliteJournalMode::Truncate,
        "PERSIST" => SqliteJournalMode::Persist,
        "MEMORY" => SqliteJournalMode::Memory,
        "OFF" => SqliteJournalMode::Off,
        _ => SqliteJournalMode::Wal,
    }
}

fn sanitize_synchronous(value: &str) -> SqliteSynchronous {
    match value.trim().to_uppercase().as_str() {
        "OFF" => SqliteSynchronous::Off,
        "FULL" => SqliteSynchronous::Full,
        "EXTRA" => SqliteSynchronous::Extra,
        _ => SqliteSynchronous::Normal,
    }
}

/// Shard factory: owns the data root and per-open pragma settings.
#[derive(Debug, Clone)]
pub struct TickStore {
    data_root: PathBuf,
    busy_timeout_ms: u64,
    journal_mode: SqliteJournalMode,
    synchronous: SqliteSynchronous,
    wal_autocheckpoint: u32,
}

impl TickStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            busy_timeout_ms: config.busy_timeout_ms.max(1),
            journal_mode: sanitize_journal_mode(&config.journal_mode),
            synchronous: sanitize_synchronous(&config.synchronous),
            wal_autocheckpoint: config.wal_autocheckpoint,
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn db_path(&self, trading_day: &str) -> PathBuf {
        db_path_for_trading_day(&self.data_root, trading_day)
    }

    fn connect_options(&self, db_path: &Path) -> SqliteConnectOptions {
        let mut options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(self.journal_mode)
            .synchronous(self.synchronous)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .pragma("temp_store", "MEMORY");
        if self.wal_autocheckpoint > 0 {
            options = options.pragma("wal_autocheckpoint", self.wal_autocheckpoint.to_string());
        }
        options
    }

    async fn connect(&self, trading_day: &str) -> Result<SqliteConnection> {
        let db_path = self.db_path(trading_day);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = self.connect_options(&db_path).connect().await?;
        ensure_schema(&mut conn).await?;
        Ok(conn)
    }

    /// Open or create the day's shard and run the migration; returns its path.
    pub async fn ensure_db(&self, trading_day: &str) -> Result<PathBuf> {
        let mut conn = self.connect(trading_day).await?;
        let _ = conn.close().await;
        Ok(self.db_path(trading_day))
    }

    /// Serialized writer for the persist worker. Exactly one lives at a time;
    /// recovery spawns a fresh one.
    pub fn open_writer(
        &self,
        detector: Option<GapDetector>,
        report: Option<Arc<QualityReport>>,
    ) -> TickWriter {
        TickWriter {
            store: self.clone(),
            conns: HashMap::new(),
            detector,
            report,
        }
    }

    /// Seed map of `symbol → MAX(seq)` from up to `max_db_files` of the given
    /// shards. Missing shards are skipped.
    pub async fn fetch_max_seq_by_symbol_recent(
        &self,
        symbols: &[String],
        trading_days: &[String],
        max_db_files: usize,
    ) -> Result<HashMap<String, i64>> {
        let mut seed: HashMap<String, i64> = HashMap::new();
        if symbols.is_empty() {
            return Ok(seed);
        }

        for trading_day in trading_days.iter().take(max_db_files.max(1)) {
            if !self.db_path(trading_day).exists() {
                continue;
            }
            let mut conn = self.connect(trading_day).await?;
            let placeholders = vec!["?"; symbols.len()].join(",");
            let sql = format!(
                "SELECT symbol, MAX(seq) AS max_seq FROM ticks \
                 WHERE trading_day = ? AND seq IS NOT NULL \
                 AND symbol IN ({placeholders}) GROUP BY symbol"
            );
            let mut query = sqlx::query(&sql).bind(trading_day);
            for symbol in symbols {
                query = query.bind(symbol);
            }
            let rows = query.fetch_all(&mut conn).await?;
            let _ = conn.close().await;

            for row in rows {
                let Ok(symbol) = row.try_get::<String, _>("symbol") else {
                    continue;
                };
                let Ok(Some(max_seq)) = row.try_get::<Option<i64>, _>("max_seq") else {
                    continue;
                };
                seed.entry(symbol)
                    .and_modify(|current| *current = (*current).max(max_seq))
                    .or_insert(max_seq);
            }
        }
        Ok(seed)
    }

    /// Row count for the day's shard; 0 when the shard does not exist yet.
    /// Read-only and safe alongside the writer under WAL.
    pub async fn count_rows(&self, trading_day: &str) -> Result<i64> {
        if !self.db_path(trading_day).exists() {
            return Ok(0);
        }
        let mut conn = self.connect(trading_day).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ticks")
            .fetch_one(&mut conn)
            .await?;
        let _ = conn.close().await;
        Ok(count)
    }

    /// Total size of `*.db-wal` files across shards, for the heartbeat line.
    pub fn wal_size_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.data_root) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(".db-wal"))
            })
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }
}

/// Per-worker writer: caches one connection per trading day and is the only
/// path that writes into shards.
pub struct TickWriter {
    store: TickStore,
    conns: HashMap<String, SqliteConnection>,
    detector: Option<GapDetector>,
    report: Option<Arc<QualityReport>>,
}

impl TickWriter {
    /// Idempotent batch insert. Gap records derived from the batch are
    /// written in the same transaction; detector state advances only after
    /// the commit succeeded. On error the cached handle for the day is
    /// closed so the next insert reopens.
    pub async fn insert_ticks(
        &mut self,
        trading_day: &str,
        rows: &[TickRow],
    ) -> Result<PersistResult> {
        let db_path = self.store.db_path(trading_day);
        if rows.is_empty() {
            return Ok(PersistResult {
                db_path,
                batch: 0,
                inserted: 0,
                ignored: 0,
                commit_latency_ms: 0,
            });
        }

        let plan = self
            .detector
            .as_ref()
            .filter(|d| d.enabled())
            .map(|d| d.build_plan(rows));

        let mut conn = match self.conns.remove(trading_day) {
            Some(conn) => conn,
            None => self.store.connect(trading_day).await?,
        };

        let start = Instant::now();
        let insert_result = Self::insert_in_tx(&mut conn, rows, plan.as_ref()).await;

        let inserted = match insert_result {
            Ok(inserted) => inserted,
            Err(err) => {
                let _ = conn.close().await;
                return Err(err);
            }
        };
        let commit_latency_ms = start.elapsed().as_millis() as u64;
        let ignored = rows.len() as u64 - inserted;

        if let (Some(detector), Some(plan)) = (self.detector.as_mut(), plan.as_ref()) {
            detector.apply_plan(plan);
        }
        if let Some(report) = self.report.clone() {
            let summary_json = report.record_commit(trading_day, rows, inserted, ignored, plan.as_ref());
            let symbols_json = report.symbols_json(trading_day);
            if let Err(err) = sqlx::query(UPSERT_DAILY_QUALITY_SQL)
                .bind(trading_day)
                .bind(now_ms())
                .bind(hostname())
                .bind(symbols_json)
                .bind(summary_json)
                .execute(&mut conn)
                .await
            {
                warn!(trading_day, error = %err, "daily_quality_upsert_failed");
            }
        }
        self.conns.insert(trading_day.to_string(), conn);

        info!(
            db_path = %db_path.display(),
            batch = rows.len(),
            inserted,
            ignored,
            commit_latency_ms,
            gaps = plan.as_ref().map(|p| p.hard_gaps.len()).unwrap_or(0),
            "persist_ticks"
        );

        Ok(PersistResult {
            db_path,
            batch: rows.len(),
            inserted,
            ignored,
            commit_latency_ms,
        })
    }

    async fn insert_in_tx(
        conn: &mut SqliteConnection,
        rows: &[TickRow],
        plan: Option<&crate::quality::GapPlan>,
    ) -> Result<u64> {
        let batch_inserted_at_ms = now_ms();
        let mut tx = conn.begin().await?;
        let mut inserted = 0u64;

        for row in rows {
            let inserted_at_ms = if row.inserted_at_ms > 0 {
                row.inserted_at_ms
            } else {
                batch_inserted_at_ms
            };
            let result = sqlx::query(INSERT_TICK_SQL)
                .bind(&row.market)
                .bind(&row.symbol)
                .bind(row.ts_ms)
                .bind(row.price)
                .bind(row.volume)
                .bind(row.turnover)
                .bind(&row.direction)
                .bind(row.seq)
                .bind(&row.tick_type)
                .bind(row.push_type.as_str())
                .bind(&row.provider)
                .bind(&row.trading_day)
                .bind(row.recv_ts_ms)
                .bind(inserted_at_ms)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        if let Some(plan) = plan {
            let detected_at_ms = now_ms();
            for gap in &plan.hard_gaps {
                sqlx::query(INSERT_GAP_SQL)
                    .bind(&gap.trading_day)
                    .bind(&gap.symbol)
                    .bind(gap.gap_start_ts_ms)
                    .bind(gap.gap_end_ts_ms)
                    .bind(gap.gap_sec)
                    .bind(detected_at_ms)
                    .bind(gap.reason)
                    .bind(&gap.meta_json)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Invalidate the cached handle for a day; the next insert reopens.
    pub async fn reset_connection(&mut self, trading_day: &str) {
        if let Some(conn) = self.conns.remove(trading_day) {
            let _ = conn.close().await;
        }
    }

    pub async fn close(&mut self) {
        for (_, conn) in self.conns.drain() {
            let _ = conn.close().await;
        }
    }
}

pub fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{parse_trading_sessions, MarketCalendar, SessionCalendar};
    use crate::config::QualityConfig;
    use crate::types::PushType;
    use chrono::TimeZone;

    fn store_config(root: &Path) -> StoreConfig {
        StoreConfig {
            data_root: root.to_path_buf(),
            journal_mode: "WAL".into(),
            synchronous: "NORMAL".into(),
            busy_timeout_ms: 5000,
            wal_autocheckpoint: 0,
        }
    }

    fn tick(symbol: &str, ts_ms: i64, seq: Option<i64>, price: Option<f64>) -> TickRow {
        TickRow {
            market: "HK".into(),
            symbol: symbol.into(),
            ts_ms,
            price,
            volume: Some(100),
            turnover: Some(30_050.0),
            direction: Some("BUY".into()),
            seq,
            tick_type: Some("AUTO_MATCH".into()),
            push_type: PushType::Push,
            provider: Some("gateway".into()),
            trading_day: "20240102".into(),
            recv_ts_ms: ts_ms + 5,
            inserted_at_ms: 0,
        }
    }

    async fn count_rows(store: &TickStore, day: &str, table: &str) -> i64 {
        let mut conn = store.connect(day).await.unwrap();
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut conn)
            .await
            .unwrap();
        let _ = conn.close().await;
        count
    }

    #[tokio::test]
    async fn dedupe_by_seq_keeps_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(&store_config(dir.path()));
        let mut writer = store.open_writer(None, None);

        let first = tick("HK.00700", 1_704_159_000_000, Some(123), Some(300.5));
        let mut second = tick("HK.00700", 1_704_159_000_000, Some(123), Some(300.6));
        second.recv_ts_ms += 100;

        let result = writer.insert_ticks("20240102", &[first]).await.unwrap();
        assert_eq!(result.inserted, 1);
        let result = writer.insert_ticks("20240102", &[second]).await.unwrap();
        assert_eq!(result.inserted, 0);
        assert_eq!(result.ignored, 1);
        writer.close().await;

        assert_eq!(count_rows(&store, "20240102", "ticks").await, 1);
        let mut conn = store.connect("20240102").await.unwrap();
        let price: f64 = sqlx::query_scalar("SELECT price FROM ticks WHERE symbol = 'HK.00700'")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        let _ = conn.close().await;
        assert_eq!(price, 300.5);
    }

    #[tokio::test]
    async fn dedupe_by_composite_key_when_seq_is_null() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(&store_config(dir.path()));
        let mut writer = store.open_writer(None, None);

        let row = tick("HK.00700", 1_704_159_000_500, None, Some(300.5));
        let result = writer
            .insert_ticks("20240102", &[row.clone(), row.clone()])
            .await
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.ignored, 1);

        // A same-ts row with a different price is a distinct tick.
        let other = tick("HK.00700", 1_704_159_000_500, None, Some(300.6));
        let result = writer.insert_ticks("20240102", &[other]).await.unwrap();
        assert_eq!(result.inserted, 1);
        writer.close().await;

        assert_eq!(count_rows(&store, "20240102", "ticks").await, 2);
    }

    #[tokio::test]
    async fn replaying_a_batch_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(&store_config(dir.path()));
        let mut writer = store.open_writer(None, None);

        let rows: Vec<TickRow> = (1..=10)
            .map(|i| tick("HK.00700", 1_704_159_000_000 + i * 1000, Some(i), Some(300.0)))
            .collect();

        let result = writer.insert_ticks("20240102", &rows).await.unwrap();
        assert_eq!(result.inserted, 10);
        let result = writer.insert_ticks("20240102", &rows).await.unwrap();
        assert_eq!(result.inserted, 0);
        assert_eq!(result.ignored, 10);
        writer.close().await;
    }

    #[tokio::test]
    async fn migration_is_idempotent_and_upgrades_legacy_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(&store_config(dir.path()));

        // Build a v0 shard by hand: missing late columns plus the legacy
        // unique index that rejected same-ts ticks.
        let db_path = store.db_path("20240102");
        std::fs::create_dir_all(dir.path()).unwrap();
        let mut conn = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .connect()
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE ticks (
               market TEXT NOT NULL, symbol TEXT NOT NULL, ts_ms INTEGER NOT NULL,
               price REAL, volume INTEGER, turnover REAL, inserted_at_ms INTEGER NOT NULL
             );",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query("CREATE UNIQUE INDEX uniq_ticks_symbol_ts ON ticks(symbol, ts_ms);")
            .execute(&mut conn)
            .await
            .unwrap();
        let _ = conn.close().await;

        store.ensure_db("20240102").await.unwrap();
        store.ensure_db("20240102").await.unwrap();

        let mut conn = store.connect("20240102").await.unwrap();
        let columns: Vec<String> = sqlx::query("PRAGMA table_info(ticks);")
            .fetch_all(&mut conn)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.try_get::<String, _>("name").unwrap())
            .collect();
        assert!(columns.contains(&"recv_ts_ms".to_string()));
        assert!(columns.contains(&"seq".to_string()));
        assert!(columns.contains(&"trading_day".to_string()));

        let indexes: Vec<String> = sqlx::query("PRAGMA index_list('ticks');")
            .fetch_all(&mut conn)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.try_get::<String, _>("name").unwrap())
            .collect();
        assert!(!indexes.contains(&"uniq_ticks_symbol_ts".to_string()));
        assert!(indexes.contains(&"uniq_ticks_symbol_seq".to_string()));

        let version: i64 = sqlx::query_scalar("PRAGMA user_version;")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(version, crate::db::schema::SCHEMA_VERSION);
        let _ = conn.close().await;

        // Same-ts ticks with distinct seq must now coexist.
        let mut writer = store.open_writer(None, None);
        let result = writer
            .insert_ticks(
                "20240102",
                &[
                    tick("HK.00700", 1_704_159_000_000, Some(1), Some(300.0)),
                    tick("HK.00700", 1_704_159_000_000, Some(2), Some(300.1)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(result.inserted, 2);
        writer.close().await;
    }

    #[tokio::test]
    async fn gap_records_commit_alongside_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(&store_config(dir.path()));

        let quality = QualityConfig {
            gap_enabled: true,
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
        let detector = GapDetector::new(&quality, calendar);
        let report = Arc::new(QualityReport::new(dir.path()));
        let mut writer = store.open_writer(Some(detector), Some(report.clone()));

        let base = HK_TZ
            .with_ymd_and_hms(2024, 1, 2, 9, 30, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        let rows = vec![
            tick("HK.00700", base, Some(1), Some(300.0)),
            tick("HK.00700", base + 1000, Some(2), Some(300.1)),
            tick("HK.00700", base + 2000, Some(3), Some(300.2)),
            tick("HK.00700", base + 20_000, Some(4), Some(300.3)),
        ];
        let result = writer.insert_ticks("20240102", &rows).await.unwrap();
        assert_eq!(result.inserted, 4);
        writer.close().await;

        assert_eq!(count_rows(&store, "20240102", "gaps").await, 1);
        let mut conn = store.connect("20240102").await.unwrap();
        let (gap_sec, reason): (f64, String) =
            sqlx::query_as("SELECT gap_sec, reason FROM gaps LIMIT 1")
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(gap_sec, 18.0);
        assert_eq!(reason, "hard_gap");

        let quality_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM daily_quality")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(quality_rows, 1);
        let _ = conn.close().await;
    }

    #[tokio::test]
    async fn fetch_max_seq_scans_recent_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(&store_config(dir.path()));
        let mut writer = store.open_writer(None, None);

        let mut old_rows = vec![
            tick("HK.00700", 1_704_072_600_000, Some(50), Some(300.0)),
            tick("HK.00005", 1_704_072_601_000, Some(70), Some(60.0)),
        ];
        for row in &mut old_rows {
            row.trading_day = "20240101".into();
        }
        writer.insert_ticks("20240101", &old_rows).await.unwrap();

        let new_rows = vec![tick("HK.00700", 1_704_159_000_000, Some(90), Some(300.0))];
        writer.insert_ticks("20240102", &new_rows).await.unwrap();
        writer.close().await;

        let symbols = vec!["HK.00700".to_string(), "HK.00005".to_string()];
        let days = vec!["20240102".to_string(), "20240101".to_string()];
        let seed = store
            .fetch_max_seq_by_symbol_recent(&symbols, &days, 5)
            .await
            .unwrap();
        assert_eq!(seed.get("HK.00700"), Some(&90));
        assert_eq!(seed.get("HK.00005"), Some(&70));

        // Bounding the scan to one file hides the older shard.
        let seed = store
            .fetch_max_seq_by_symbol_recent(&symbols, &days, 1)
            .await
            .unwrap();
        assert_eq!(seed.get("HK.00700"), Some(&90));
        assert_eq!(seed.get("HK.00005"), None);
    }

    #[test]
    fn recent_days_are_descending_compact() {
        let days = recent_trading_days(3);
        assert_eq!(days.len(), 3);
        assert!(days[0] > days[1] && days[1] > days[2]);
        assert!(days.iter().all(|d| d.len() == 8));
    }
}
