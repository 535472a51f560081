//! Core domain model for Elenco.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "elenco-core";

/// Best-effort field set produced by extraction. Missing fields are `None`,
/// never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractedFields {
    pub name: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
}

impl ExtractedFields {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.address.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.website.is_none()
    }
}

/// Persisted business record. `source_url` is the natural unique key; the
/// record is append-only once inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub name: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub source_url: String,
    pub scraped_at: DateTime<Utc>,
}

impl BusinessRecord {
    pub fn from_extracted(
        source_url: impl Into<String>,
        fields: ExtractedFields,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: fields.name,
            category: fields.category,
            address: fields.address,
            phone: fields.phone,
            email: fields.email,
            website: fields.website,
            source_url: source_url.into(),
            scraped_at,
        }
    }

    /// Empty placeholder for a page that was fetched but yielded nothing.
    pub fn empty(source_url: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self::from_extracted(source_url, ExtractedFields::default(), scraped_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_report_empty() {
        assert!(ExtractedFields::default().is_empty());
        let fields = ExtractedFields {
            email: Some("info@example.ch".into()),
            ..Default::default()
        };
        assert!(!fields.is_empty());
    }

    #[test]
    fn record_assembly_keeps_source_url() {
        let fields = ExtractedFields {
            name: Some("Garage Rossi SA".into()),
            phone: Some("+41 91 000 00 00".into()),
            ..Default::default()
        };
        let record =
            BusinessRecord::from_extracted("https://example.ch/d/garage-rossi", fields, Utc::now());
        assert_eq!(record.source_url, "https://example.ch/d/garage-rossi");
        assert_eq!(record.name.as_deref(), Some("Garage Rossi SA"));
        assert!(record.category.is_none());
    }
}
