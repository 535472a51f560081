//! CSV export of the scraped record set for downstream consumers.

use std::path::Path;

use elenco_core::BusinessRecord;
use elenco_store::{ResultStore, StoreError};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "elenco-export";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("reading records: {0}")]
    Store(#[from] StoreError),
    #[error("writing csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("flushing csv: {0}")]
    Io(#[from] std::io::Error),
}

const HEADER: [&str; 8] = [
    "name",
    "category",
    "address",
    "phone",
    "email",
    "website",
    "source_url",
    "scraped_at",
];

/// Write every stored record to `path` as CSV, ordered by business name.
/// Returns the number of data rows written.
pub async fn export_csv(store: &ResultStore, path: &Path) -> Result<u64, ExportError> {
    let records = store.all_records().await?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(HEADER)?;
    for record in &records {
        writer.write_record(csv_row(record))?;
    }
    writer.flush()?;
    info!(rows = records.len(), path = %path.display(), "csv export written");
    Ok(records.len() as u64)
}

fn csv_row(record: &BusinessRecord) -> [String; 8] {
    let cell = |field: &Option<String>| field.clone().unwrap_or_default();
    [
        cell(&record.name),
        cell(&record.category),
        cell(&record.address),
        cell(&record.phone),
        cell(&record.email),
        cell(&record.website),
        record.source_url.clone(),
        record.scraped_at.to_rfc3339(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use elenco_core::ExtractedFields;
    use tempfile::tempdir;

    fn record(name: &str, url: &str) -> BusinessRecord {
        BusinessRecord::from_extracted(
            url,
            ExtractedFields {
                name: Some(name.to_string()),
                phone: Some("+41 91 000 00 00".to_string()),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn export_orders_rows_and_blanks_missing_fields() {
        let dir = tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("e.db"))
            .await
            .expect("open store");
        store
            .upsert_if_absent(&record("Zurich Cafe", "https://example.ch/d/z"))
            .await
            .expect("insert");
        store
            .upsert_if_absent(&record("Antica Osteria", "https://example.ch/d/a"))
            .await
            .expect("insert");
        store
            .upsert_if_absent(&BusinessRecord::empty("https://example.ch/d/empty", Utc::now()))
            .await
            .expect("insert");

        let out = dir.path().join("out.csv");
        let rows = export_csv(&store, &out).await.expect("export");
        assert_eq!(rows, 3);

        let text = std::fs::read_to_string(&out).expect("read csv");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("name,category,address"));
        // NULL name sorts first in sqlite ORDER BY
        assert!(lines[1].contains("https://example.ch/d/empty"));
        assert!(lines[2].starts_with("Antica Osteria"));
        assert!(lines[3].starts_with("Zurich Cafe"));
    }

    #[tokio::test]
    async fn export_of_empty_store_writes_header_only() {
        let dir = tempdir().expect("tempdir");
        let store = ResultStore::open(&dir.path().join("e.db"))
            .await
            .expect("open store");
        let out = dir.path().join("out.csv");
        let rows = export_csv(&store, &out).await.expect("export");
        assert_eq!(rows, 0);
        let text = std::fs::read_to_string(&out).expect("read csv");
        assert_eq!(text.lines().count(), 1);
    }
}
