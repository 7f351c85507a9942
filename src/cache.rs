//! Persistent ingest cache.
//!
//! Maps archive content hashes to their indexed state so that re-running
//! ingest over an unchanged source tree performs zero extractions and zero
//! embedding calls. SQLite with WAL keeps concurrent readers cheap while
//! writes stay serialized.
//!
//! A cache that cannot be opened (missing directory, permissions) degrades
//! to "no cache": every archive is treated as new, a warning is logged, and
//! ingest proceeds.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// Value stored per archive content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub status: String,
    pub indexed_at: i64,
    pub topic_count: i64,
    pub version: String,
    pub language: String,
    pub source_path: String,
}

pub const STATUS_INDEXED: &str = "indexed";

pub struct IngestCache {
    pool: Option<SqlitePool>,
}

impl IngestCache {
    /// Open (or create) the cache database. Never fails: open errors are
    /// logged and produce a disabled cache.
    pub async fn open(path: &Path) -> Self {
        match Self::try_open(path).await {
            Ok(pool) => Self { pool: Some(pool) },
            Err(e) => {
                tracing::warn!(
                    cache = %path.display(),
                    error = %e,
                    "ingest cache unavailable; every archive will be treated as new"
                );
                Self { pool: None }
            }
        }
    }

    async fn try_open(path: &Path) -> Result<SqlitePool> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archive_cache (
                content_hash TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                indexed_at INTEGER NOT NULL,
                topic_count INTEGER NOT NULL,
                version TEXT NOT NULL,
                language TEXT NOT NULL,
                source_path TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(pool)
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Look up an archive by content hash. A disabled cache or a read error
    /// reports a miss.
    pub async fn lookup(&self, content_hash: &str) -> Option<ArchiveRecord> {
        let pool = self.pool.as_ref()?;
        let row = sqlx::query(
            "SELECT status, indexed_at, topic_count, version, language, source_path
             FROM archive_cache WHERE content_hash = ?",
        )
        .bind(content_hash)
        .fetch_optional(pool)
        .await;

        match row {
            Ok(Some(row)) => Some(ArchiveRecord {
                status: row.get("status"),
                indexed_at: row.get("indexed_at"),
                topic_count: row.get("topic_count"),
                version: row.get("version"),
                language: row.get("language"),
                source_path: row.get("source_path"),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "ingest cache read failed; treating as miss");
                None
            }
        }
    }

    /// Record a successful ingest for an archive hash.
    pub async fn mark_indexed(
        &self,
        content_hash: &str,
        topic_count: i64,
        version: &str,
        language: &str,
        source_path: &str,
    ) -> Result<()> {
        let Some(pool) = self.pool.as_ref() else {
            return Ok(());
        };
        sqlx::query(
            r#"
            INSERT INTO archive_cache
                (content_hash, status, indexed_at, topic_count, version, language, source_path)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                status = excluded.status,
                indexed_at = excluded.indexed_at,
                topic_count = excluded.topic_count,
                version = excluded.version,
                language = excluded.language,
                source_path = excluded.source_path
            "#,
        )
        .bind(content_hash)
        .bind(STATUS_INDEXED)
        .bind(chrono::Utc::now().timestamp())
        .bind(topic_count)
        .bind(version)
        .bind(language)
        .bind(source_path)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Forget everything. Used by forced re-ingest (`--recreate`).
    pub async fn erase_all(&self) -> Result<()> {
        let Some(pool) = self.pool.as_ref() else {
            return Ok(());
        };
        sqlx::query("DELETE FROM archive_cache").execute(pool).await?;
        Ok(())
    }

    /// Count of archives currently recorded as indexed.
    pub async fn indexed_count(&self) -> i64 {
        let Some(pool) = self.pool.as_ref() else {
            return 0;
        };
        sqlx::query_scalar("SELECT COUNT(*) FROM archive_cache WHERE status = ?")
            .bind(STATUS_INDEXED)
            .fetch_one(pool)
            .await
            .unwrap_or(0)
    }

    pub async fn close(&self) {
        if let Some(pool) = self.pool.as_ref() {
            pool.close().await;
        }
    }
}
