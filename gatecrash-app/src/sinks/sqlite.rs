//! SQLite sink. Appends run inside one transaction per batch; a killed
//! process rolls back to the last committed batch, never a partial row.

use async_trait::async_trait;
use gatecrash_engine::{Finding, ResultSink};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS findings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    target_url TEXT NOT NULL,
    module TEXT NOT NULL,
    method TEXT NOT NULL,
    raw_uri TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    content_length INTEGER,
    response_bytes INTEGER NOT NULL,
    title TEXT NOT NULL,
    server TEXT NOT NULL,
    redirect TEXT NOT NULL,
    response_time_ms INTEGER NOT NULL,
    debug_token TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_findings_status_module
    ON findings (status_code, module);
"#;

pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        // The serializer task is the only writer; one connection is enough.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Read back findings in report order `(status_code, module)`.
    pub async fn read_sorted(&self) -> anyhow::Result<Vec<Finding>> {
        let rows: Vec<Finding> = sqlx::query_as::<_, SqliteFinding>(
            "SELECT scan_id, timestamp, target_url, module, method, raw_uri, status_code, \
             content_type, content_length, response_bytes, title, server, redirect, \
             response_time_ms, debug_token \
             FROM findings ORDER BY status_code, module",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
        Ok(rows)
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn append(&self, findings: Vec<Finding>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for f in &findings {
            sqlx::query(
                "INSERT INTO findings (scan_id, timestamp, target_url, module, method, raw_uri, \
                 status_code, content_type, content_length, response_bytes, title, server, \
                 redirect, response_time_ms, debug_token) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&f.scan_id)
            .bind(f.timestamp.to_rfc3339())
            .bind(&f.target_url)
            .bind(&f.module)
            .bind(&f.method)
            .bind(&f.raw_uri)
            .bind(i64::from(f.status_code))
            .bind(&f.content_type)
            .bind(f.content_length.map(|v| v as i64))
            .bind(f.response_bytes as i64)
            .bind(&f.title)
            .bind(&f.server)
            .bind(&f.redirect)
            .bind(f.response_time_ms as i64)
            .bind(&f.debug_token)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        // WAL checkpoints on close; nothing extra to do per flush.
        Ok(())
    }
}

/// Row shape for reads; converted back into the shared `Finding`.
#[derive(sqlx::FromRow)]
struct SqliteFinding {
    scan_id: String,
    timestamp: String,
    target_url: String,
    module: String,
    method: String,
    raw_uri: String,
    status_code: i64,
    content_type: String,
    content_length: Option<i64>,
    response_bytes: i64,
    title: String,
    server: String,
    redirect: String,
    response_time_ms: i64,
    debug_token: String,
}

impl From<SqliteFinding> for Finding {
    fn from(row: SqliteFinding) -> Self {
        Finding {
            scan_id: row.scan_id,
            timestamp: chrono::DateTime::parse_from_rfc3339(&row.timestamp)
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
            target_url: row.target_url,
            module: row.module,
            method: row.method,
            raw_uri: row.raw_uri,
            status_code: row.status_code as u16,
            content_type: row.content_type,
            content_length: row.content_length.map(|v| v as u64),
            response_bytes: row.response_bytes as u64,
            title: row.title,
            server: row.server,
            redirect: row.redirect,
            response_time_ms: row.response_time_ms as u64,
            debug_token: row.debug_token,
        }
    }
}
