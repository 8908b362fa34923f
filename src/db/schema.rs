//! Per-shard schema and its idempotent migration, guarded by
//! `PRAGMA user_version`. Shards are created at runtime (one per trading
//! day) so every open path runs through `ensure_schema`.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use std::collections::HashSet;
use tracing::warn;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

pub const CREATE_TICKS_TABLE_SQL: &str = "\
CREATE TABLE ticks (
  market TEXT NOT NULL,
  symbol TEXT NOT NULL,
  ts_ms INTEGER NOT NULL,
  price REAL,
  volume INTEGER,
  turnover REAL,
  direction TEXT,
  seq INTEGER,
  tick_type TEXT,
  push_type TEXT,
  provider TEXT,
  trading_day TEXT NOT NULL,
  recv_ts_ms INTEGER NOT NULL DEFAULT 0,
  inserted_at_ms INTEGER NOT NULL
);";

/// Late-added columns, applied with `ADD COLUMN` when an older shard is
/// missing them.
const ALTER_COLUMN_SQL: &[(&str, &str)] = &[
    ("direction", "ALTER TABLE ticks ADD COLUMN direction TEXT;"),
    ("seq", "ALTER TABLE ticks ADD COLUMN seq INTEGER;"),
    ("tick_type", "ALTER TABLE ticks ADD COLUMN tick_type TEXT;"),
    ("push_type", "ALTER TABLE ticks ADD COLUMN push_type TEXT;"),
    ("provider", "ALTER TABLE ticks ADD COLUMN provider TEXT;"),
    (
        "trading_day",
        "ALTER TABLE ticks ADD COLUMN trading_day TEXT NOT NULL DEFAULT '';",
    ),
    (
        "recv_ts_ms",
        "ALTER TABLE ticks ADD COLUMN recv_ts_ms INTEGER NOT NULL DEFAULT 0;",
    ),
    (
        "inserted_at_ms",
        "ALTER TABLE ticks ADD COLUMN inserted_at_ms INTEGER NOT NULL DEFAULT 0;",
    ),
];

const INDEX_SQLS: &[(&str, &str)] = &[
    (
        "idx_ticks_symbol_day_ts",
        "CREATE INDEX idx_ticks_symbol_day_ts ON ticks(symbol, trading_day, ts_ms);",
    ),
    (
        "idx_ticks_symbol_seq",
        "CREATE INDEX idx_ticks_symbol_seq ON ticks(symbol, seq);",
    ),
    (
        "uniq_ticks_symbol_seq",
        "CREATE UNIQUE INDEX uniq_ticks_symbol_seq ON ticks(symbol, seq) WHERE seq IS NOT NULL;",
    ),
    (
        "uniq_ticks_symbol_ts_price_vol_turnover",
        "CREATE UNIQUE INDEX uniq_ticks_symbol_ts_price_vol_turnover
  ON ticks(symbol, ts_ms, price, volume, turnover) WHERE seq IS NULL;",
    ),
];

/// The two sanctioned dedupe indexes; any other unique index over
/// `(symbol, ts_ms, ...)` without `seq` is legacy and conflicts with
/// dedupe semantics.
const ALLOWED_UNIQUE_INDEXES: &[&str] = &[
    "uniq_ticks_symbol_seq",
    "uniq_ticks_symbol_ts_price_vol_turnover",
];

pub const INSERT_TICK_SQL: &str = "\
INSERT OR IGNORE INTO ticks (
  market, symbol, ts_ms, price, volume, turnover, direction, seq, tick_type,
  push_type, provider, trading_day, recv_ts_ms, inserted_at_ms
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);";

const CREATE_GAPS_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS gaps (
  trading_day TEXT NOT NULL,
  symbol TEXT NOT NULL,
  gap_start_ts_ms INTEGER NOT NULL,
  gap_end_ts_ms INTEGER NOT NULL,
  gap_sec REAL NOT NULL,
  detected_at_ms INTEGER NOT NULL,
  reason TEXT NOT NULL,
  meta_json TEXT NOT NULL,
  PRIMARY KEY (symbol, gap_start_ts_ms, gap_end_ts_ms)
);";

const CREATE_GAPS_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_gaps_day_symbol ON gaps(trading_day, symbol);";

pub const INSERT_GAP_SQL: &str = "\
INSERT OR IGNORE INTO gaps (
  trading_day, symbol, gap_start_ts_ms, gap_end_ts_ms, gap_sec, detected_at_ms, reason, meta_json
) VALUES (?, ?, ?, ?, ?, ?, ?, ?);";

const CREATE_DAILY_QUALITY_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS daily_quality (
  trading_day TEXT PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  host TEXT,
  symbols_json TEXT NOT NULL,
  summary_json TEXT NOT NULL
);";

pub const UPSERT_DAILY_QUALITY_SQL: &str = "\
INSERT INTO daily_quality (trading_day, created_at_ms, host, symbols_json, summary_json)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(trading_day) DO UPDATE SET
  created_at_ms=excluded.created_at_ms,
  host=excluded.host,
  symbols_json=excluded.symbols_json,
  summary_json=excluded.summary_json;";

async fn existing_schema_objects(conn: &mut SqliteConnection) -> Result<HashSet<String>> {
    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type IN ('table', 'index');")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("name").ok())
        .collect())
}

async fn existing_columns(conn: &mut SqliteConnection) -> Result<HashSet<String>> {
    let rows = sqlx::query("PRAGMA table_info(ticks);")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("name").ok())
        .collect())
}

async fn index_columns(conn: &mut SqliteConnection, index_name: &str) -> Result<Vec<String>> {
    let escaped = index_name.replace('\'', "''");
    let rows = sqlx::query(&format!("PRAGMA index_info('{escaped}');"))
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<String>, _>("name").ok().flatten())
        .collect())
}

/// Drop any unique index whose leading columns are `(symbol, ts_ms)` without
/// `seq` — a legacy shape that would reject legitimate same-ts ticks.
async fn drop_legacy_unique_indexes(conn: &mut SqliteConnection) -> Result<()> {
    let rows = sqlx::query("PRAGMA index_list('ticks');")
        .fetch_all(&mut *conn)
        .await?;

    let mut legacy = Vec::new();
    for row in rows {
        let Ok(index_name) = row.try_get::<String, _>("name") else {
            continue;
        };
        let is_unique = row.try_get::<i64, _>("unique").unwrap_or(0) != 0;
        if !is_unique || ALLOWED_UNIQUE_INDEXES.contains(&index_name.as_str()) {
            continue;
        }
        let columns = index_columns(conn, &index_name).await?;
        if columns.len() >= 2
            && columns[0] == "symbol"
            && columns[1] == "ts_ms"
            && !columns.iter().any(|c| c == "seq")
        {
            legacy.push((index_name, columns));
        }
    }

    for (index_name, columns) in legacy {
        warn!(
            index = %index_name,
            columns = ?columns,
            "schema_migration dropping_legacy_unique_index"
        );
        let escaped = index_name.replace('"', "\"\"");
        sqlx::query(&format!("DROP INDEX IF EXISTS \"{escaped}\";"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Apply the schema in order, each step guarded by existence checks, then
/// bump `user_version`. Safe to run on every open.
pub async fn ensure_schema(conn: &mut SqliteConnection) -> Result<()> {
    let existing = existing_schema_objects(conn).await?;
    if !existing.contains("ticks") {
        sqlx::query(CREATE_TICKS_TABLE_SQL).execute(&mut *conn).await?;
    } else {
        let columns = existing_columns(conn).await?;
        for (col, alter_sql) in ALTER_COLUMN_SQL {
            if !columns.contains(*col) {
                warn!(column = col, "schema_migration add_column");
                sqlx::query(alter_sql).execute(&mut *conn).await?;
            }
        }
    }

    drop_legacy_unique_indexes(conn).await?;

    let existing = existing_schema_objects(conn).await?;
    for (name, sql) in INDEX_SQLS {
        if !existing.contains(*name) {
            sqlx::query(sql).execute(&mut *conn).await?;
        }
    }

    sqlx::query(CREATE_GAPS_TABLE_SQL).execute(&mut *conn).await?;
    sqlx::query(CREATE_GAPS_INDEX_SQL).execute(&mut *conn).await?;
    sqlx::query(CREATE_DAILY_QUALITY_TABLE_SQL)
        .execute(&mut *conn)
        .await?;

    let version: i64 = sqlx::query_scalar("PRAGMA user_version;")
        .fetch_one(&mut *conn)
        .await?;
    if version < SCHEMA_VERSION {
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// BUSY (5) / LOCKED (6), including their extended variants. These are
/// retriable contention, distinct from real storage failures.
pub fn is_sqlite_busy_or_locked(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    db_err
        .code()
        .and_then(|code| code.parse::<i64>().ok())
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}
