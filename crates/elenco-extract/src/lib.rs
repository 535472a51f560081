//! Extraction boundary: fetched page content to best-effort record fields.
//!
//! Site-specific markup knowledge lives in a [`SelectorProfile`] supplied as
//! data, not in code. Missing fields are `None`; only structurally unreadable
//! content is an error.

use std::path::Path;

use elenco_core::ExtractedFields;
use elenco_net::PageContent;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "elenco-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unreadable page content for {url}")]
    Unreadable { url: String },
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("reading selector profile: {0}")]
    ProfileIo(#[from] std::io::Error),
    #[error("parsing selector profile: {0}")]
    ProfileFormat(#[from] serde_json::Error),
}

/// Pure mapping from fetched content to whatever fields could be found.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, page: &PageContent) -> Result<ExtractedFields, ExtractError>;
}

/// CSS selectors for each record field. Generic contact anchors are the
/// defaults; category, address and website have no portable default and stay
/// unset unless a profile provides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorProfile {
    pub name: String,
    pub category: Option<String>,
    pub address: Option<String>,
    pub phone: String,
    pub email: String,
    pub website: Option<String>,
}

impl Default for SelectorProfile {
    fn default() -> Self {
        Self {
            name: "h1".to_string(),
            category: None,
            address: None,
            phone: "a[href^='tel:']".to_string(),
            email: "a[href^='mailto:']".to_string(),
            website: None,
        }
    }
}

impl SelectorProfile {
    pub fn from_json_file(path: &Path) -> Result<Self, ExtractError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Profile-driven extractor. Selectors compile once at construction.
#[derive(Debug)]
pub struct SelectorExtractor {
    name: Selector,
    category: Option<Selector>,
    address: Option<Selector>,
    phone: Selector,
    email: Selector,
    website: Option<Selector>,
}

impl SelectorExtractor {
    pub fn new(profile: &SelectorProfile) -> Result<Self, ExtractError> {
        Ok(Self {
            name: compile(&profile.name)?,
            category: profile.category.as_deref().map(compile).transpose()?,
            address: profile.address.as_deref().map(compile).transpose()?,
            phone: compile(&profile.phone)?,
            email: compile(&profile.email)?,
            website: profile.website.as_deref().map(compile).transpose()?,
        })
    }
}

impl RecordExtractor for SelectorExtractor {
    fn extract(&self, page: &PageContent) -> Result<ExtractedFields, ExtractError> {
        if page.body.trim().is_empty() {
            return Err(ExtractError::Unreadable {
                url: page.url.clone(),
            });
        }
        let document = Html::parse_document(&page.body);

        Ok(ExtractedFields {
            name: first_text(&document, &self.name),
            category: self
                .category
                .as_ref()
                .and_then(|sel| first_text(&document, sel)),
            address: self
                .address
                .as_ref()
                .and_then(|sel| first_text(&document, sel)),
            phone: contact_value(&document, &self.phone, "tel:"),
            email: contact_value(&document, &self.email, "mailto:"),
            website: self
                .website
                .as_ref()
                .and_then(|sel| first_href(&document, sel)),
        })
    }
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::InvalidSelector {
        selector: selector.to_string(),
        reason: err.to_string(),
    })
}

fn text_or_none(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<String>()))
}

fn first_href(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|node| node.value().attr("href"))
        .and_then(|href| text_or_none(href.to_string()))
}

/// Anchor text wins; the href minus its scheme prefix and query is the
/// fallback for icon-only anchors.
fn contact_value(document: &Html, selector: &Selector, scheme: &str) -> Option<String> {
    let node = document.select(selector).next()?;
    if let Some(text) = text_or_none(node.text().collect::<String>()) {
        return Some(text);
    }
    let href = node.value().attr("href")?;
    let value = href.strip_prefix(scheme).unwrap_or(href);
    let value = value.split('?').next().unwrap_or(value);
    text_or_none(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(body: &str) -> PageContent {
        PageContent {
            url: "https://example.ch/d/test".to_string(),
            final_url: "https://example.ch/d/test".to_string(),
            body: body.to_string(),
        }
    }

    fn default_extractor() -> SelectorExtractor {
        SelectorExtractor::new(&SelectorProfile::default()).expect("default profile compiles")
    }

    #[test]
    fn default_profile_reads_contact_anchors() {
        let html = r#"
            <html><body>
              <h1> Panetteria Croci Sagl </h1>
              <a href="tel:+41910000000">+41 91 000 00 00</a>
              <a href="mailto:info@croci.ch?subject=hi"></a>
            </body></html>
        "#;
        let fields = default_extractor().extract(&page(html)).expect("extract");
        assert_eq!(fields.name.as_deref(), Some("Panetteria Croci Sagl"));
        assert_eq!(fields.phone.as_deref(), Some("+41 91 000 00 00"));
        assert_eq!(fields.email.as_deref(), Some("info@croci.ch"));
        assert!(fields.website.is_none());
    }

    #[test]
    fn missing_fields_are_none_not_errors() {
        let fields = default_extractor()
            .extract(&page("<html><body><p>nothing here</p></body></html>"))
            .expect("extract");
        assert!(fields.is_empty());
    }

    #[test]
    fn empty_body_is_unreadable() {
        let err = default_extractor().extract(&page("   ")).unwrap_err();
        assert!(matches!(err, ExtractError::Unreadable { .. }));
    }

    #[test]
    fn profile_supplied_selectors_cover_remaining_fields() {
        let profile: SelectorProfile = serde_json::from_str(
            r#"{
                "category": "span.category",
                "address": "div.address",
                "website": "a.homepage"
            }"#,
        )
        .expect("profile json");
        let extractor = SelectorExtractor::new(&profile).expect("compile");

        let html = r#"
            <html><body>
              <h1>Garage Bianchi SA</h1>
              <span class="category">Autofficina</span>
              <div class="address">Via Lugano 12, 6900 Lugano</div>
              <a class="homepage" href="https://garagebianchi.ch">Sito web</a>
            </body></html>
        "#;
        let fields = extractor.extract(&page(html)).expect("extract");
        assert_eq!(fields.category.as_deref(), Some("Autofficina"));
        assert_eq!(fields.address.as_deref(), Some("Via Lugano 12, 6900 Lugano"));
        assert_eq!(fields.website.as_deref(), Some("https://garagebianchi.ch"));
    }

    #[test]
    fn invalid_selector_is_rejected_at_construction() {
        let profile = SelectorProfile {
            name: ":::nope".to_string(),
            ..Default::default()
        };
        let err = SelectorExtractor::new(&profile).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidSelector { .. }));
    }
}
