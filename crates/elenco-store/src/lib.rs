//! Durable, deduplicating store of business records keyed by source URL.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use elenco_core::BusinessRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "elenco-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored timestamp {value:?} for {source_url}")]
    InvalidTimestamp { source_url: String, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub with_email: u64,
    pub with_website: u64,
    pub with_phone: u64,
    pub with_category: u64,
}

/// SQLite-backed record store shared by all workers. Uniqueness on
/// `source_url` is enforced by the schema, so insert-if-absent is atomic at
/// the storage layer rather than a check-then-insert in the caller.
#[derive(Debug, Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS businesses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                category TEXT,
                address TEXT,
                phone TEXT,
                email TEXT,
                website TEXT,
                source_url TEXT NOT NULL UNIQUE,
                scraped_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert the record unless its `source_url` already exists. Returns
    /// true iff a new row was written; existing rows are never overwritten.
    pub async fn upsert_if_absent(&self, record: &BusinessRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO businesses
                (name, category, address, phone, email, website, source_url, scraped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&record.name)
        .bind(&record.category)
        .bind(&record.address)
        .bind(&record.phone)
        .bind(&record.email)
        .bind(&record.website)
        .bind(&record.source_url)
        .bind(record.scraped_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(source_url = %record.source_url, "duplicate record skipped");
        }
        Ok(inserted)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM businesses")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN email IS NOT NULL AND email != '' THEN 1 ELSE 0 END), 0) AS with_email,
                COALESCE(SUM(CASE WHEN website IS NOT NULL AND website != '' THEN 1 ELSE 0 END), 0) AS with_website,
                COALESCE(SUM(CASE WHEN phone IS NOT NULL AND phone != '' THEN 1 ELSE 0 END), 0) AS with_phone,
                COALESCE(SUM(CASE WHEN category IS NOT NULL AND category != '' THEN 1 ELSE 0 END), 0) AS with_category
            FROM businesses
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total: row.try_get::<i64, _>("total")? as u64,
            with_email: row.try_get::<i64, _>("with_email")? as u64,
            with_website: row.try_get::<i64, _>("with_website")? as u64,
            with_phone: row.try_get::<i64, _>("with_phone")? as u64,
            with_category: row.try_get::<i64, _>("with_category")? as u64,
        })
    }

    /// Full scan ordered by name, the read interface export scripts consume.
    pub async fn all_records(&self) -> Result<Vec<BusinessRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT name, category, address, phone, email, website, source_url, scraped_at
            FROM businesses
            ORDER BY name
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn source_urls(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT source_url FROM businesses")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("source_url")?))
            .collect()
    }
}

fn row_to_record(row: &SqliteRow) -> Result<BusinessRecord, StoreError> {
    let source_url: String = row.try_get("source_url")?;
    let scraped_at_raw: String = row.try_get("scraped_at")?;
    let scraped_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&scraped_at_raw)
        .map_err(|_| StoreError::InvalidTimestamp {
            source_url: source_url.clone(),
            value: scraped_at_raw,
        })?
        .with_timezone(&Utc);

    Ok(BusinessRecord {
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        address: row.try_get("address")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        website: row.try_get("website")?,
        source_url,
        scraped_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use elenco_core::ExtractedFields;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(url: &str, email: Option<&str>) -> BusinessRecord {
        BusinessRecord::from_extracted(
            url,
            ExtractedFields {
                name: Some("Studio Bernasconi".into()),
                email: email.map(str::to_string),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn second_insert_of_same_url_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("test.db")).await.expect("open");

        assert!(store
            .upsert_if_absent(&record("https://example.ch/d/1", None))
            .await
            .expect("first"));
        assert!(!store
            .upsert_if_absent(&record("https://example.ch/d/1", Some("a@b.ch")))
            .await
            .expect("second"));

        assert_eq!(store.count().await.expect("count"), 1);
        let records = store.all_records().await.expect("scan");
        // no overwrite: the first version wins
        assert!(records[0].email.is_none());
    }

    #[tokio::test]
    async fn concurrent_duplicate_upserts_persist_exactly_one_row() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(
            ResultStore::open(&dir.path().join("race.db")).await.expect("open"),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let r = record("https://example.ch/d/contended", Some("x@y.ch"));
                let _ = i;
                store.upsert_if_absent(&r).await
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.expect("join").expect("upsert") {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn stats_count_nonempty_fields_only() {
        let dir = tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("stats.db")).await.expect("open");

        store
            .upsert_if_absent(&record("https://example.ch/d/1", Some("info@uno.ch")))
            .await
            .expect("insert");
        store
            .upsert_if_absent(&record("https://example.ch/d/2", None))
            .await
            .expect("insert");
        let mut empty_email = record("https://example.ch/d/3", None);
        empty_email.email = Some(String::new());
        store.upsert_if_absent(&empty_email).await.expect("insert");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.with_email, 1);
        assert_eq!(stats.with_website, 0);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("durable.db");

        {
            let store = ResultStore::open(&path).await.expect("open");
            store
                .upsert_if_absent(&record("https://example.ch/d/kept", None))
                .await
                .expect("insert");
        }

        let reopened = ResultStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.count().await.expect("count"), 1);
        let urls = reopened.source_urls().await.expect("urls");
        assert_eq!(urls, vec!["https://example.ch/d/kept".to_string()]);
    }
}
