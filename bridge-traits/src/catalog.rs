//! Catalog Feed Abstractions
//!
//! Data shapes exchanged between license-provider connectors and the sync
//! engine. Connectors own vendor parsing and hand back these normalized
//! records. The engine owns pagination, change detection and scheduling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Provider-specific position in a paginated feed.
///
/// The start of a feed is represented by the absence of a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PageToken {
    /// 1-based page number
    Number(u32),
    /// Absolute link to the next page
    Url(String),
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageToken::Number(n) => write!(f, "page {}", n),
            PageToken::Url(url) => write!(f, "{}", url),
        }
    }
}

/// Parameters of a single page fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    pub page: Option<PageToken>,
    pub modified_since: Option<DateTime<Utc>>,
    pub page_size: u32,
}

/// One title as listed in a feed page, before detailed lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub identifier: String,
    /// Explicit availability flag, for providers that report one.
    pub active: Option<bool>,
    /// When the title entered the provider's catalog, for providers that
    /// order feeds by recency.
    pub date_added: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

/// A feed entry the connector could not make sense of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub reason: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub entries: Vec<FeedEntry>,
    pub rejected: Vec<RejectedEntry>,
    pub current_page: u32,
    pub total_pages: u32,
    pub next_page: Option<PageToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentifierData {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl IdentifierData {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for IdentifierData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Available,
    Unavailable,
    Removed,
}

/// Availability of one title in one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CirculationData {
    pub identifier: IdentifierData,
    pub licenses_owned: i64,
    pub licenses_available: i64,
    pub licenses_reserved: i64,
    pub patrons_in_hold_queue: i64,
    pub status: LicenseStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

impl CirculationData {
    /// Zero-availability update used to surface delisted titles.
    pub fn removed(identifier: IdentifierData, last_checked: DateTime<Utc>) -> Self {
        Self {
            identifier,
            licenses_owned: 0,
            licenses_available: 0,
            licenses_reserved: 0,
            patrons_in_hold_queue: 0,
            status: LicenseStatus::Removed,
            last_checked: Some(last_checked),
        }
    }

    pub fn is_available(&self) -> bool {
        self.licenses_owned > 0 || self.licenses_available > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub name: String,
    pub role: String,
}

/// Descriptive metadata of one title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibliographicData {
    pub primary_identifier: IdentifierData,
    #[serde(default)]
    pub identifiers: Vec<IdentifierData>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub medium: Option<String>,
    #[serde(default)]
    pub contributors: Vec<Contributor>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    pub data_source_last_updated: Option<DateTime<Utc>>,
    /// Availability applied together with the descriptive fields.
    #[serde(default)]
    pub circulation: Option<CirculationData>,
}

impl BibliographicData {
    pub fn new(primary_identifier: IdentifierData) -> Self {
        Self {
            primary_identifier,
            identifiers: Vec::new(),
            title: None,
            subtitle: None,
            language: None,
            publisher: None,
            published: None,
            medium: None,
            contributors: Vec::new(),
            subjects: Vec::new(),
            formats: Vec::new(),
            links: Vec::new(),
            data_source_last_updated: None,
            circulation: None,
        }
    }

    pub fn with_circulation(mut self, circulation: Option<CirculationData>) -> Self {
        self.circulation = circulation;
        self
    }
}

/// Detailed record returned by a connector lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleRecord {
    pub identifier: IdentifierData,
    pub bibliographic: Option<BibliographicData>,
    pub circulation: Option<CirculationData>,
}

/// Which parts of stored bibliographic data an update overwrites rather
/// than merges into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementPolicy {
    pub identifiers: bool,
    pub subjects: bool,
    pub contributions: bool,
    pub formats: bool,
    pub links: bool,
}

impl ReplacementPolicy {
    /// Policy for data coming straight from the license provider: the
    /// provider is authoritative for everything but equivalent identifiers.
    pub fn from_license_source() -> Self {
        Self {
            identifiers: false,
            subjects: true,
            contributions: true,
            formats: true,
            links: true,
        }
    }

    /// Merge everything, overwrite nothing.
    pub fn append_only() -> Self {
        Self {
            identifiers: false,
            subjects: false,
            contributions: false,
            formats: false,
            links: false,
        }
    }
}

/// A paginated catalog of one provider account.
#[async_trait]
pub trait CatalogFeed: Send + Sync {
    /// Identifier type this feed's entries use (e.g. "Axis 360 ID").
    fn identifier_type(&self) -> &str;

    /// Largest number of identifiers a single [`lookup`](Self::lookup) accepts.
    fn lookup_batch_size(&self) -> usize;

    /// Fetch one page of the feed.
    ///
    /// # Errors
    ///
    /// Transport and HTTP failures are reported as [`BridgeError`](crate::BridgeError)
    /// variants whose [`is_transient`](crate::BridgeError::is_transient)
    /// reflects whether a retry may help.
    async fn fetch_page(&self, request: FeedRequest) -> Result<FeedPage>;

    /// Fetch detailed records for at most `lookup_batch_size` identifiers.
    ///
    /// With `include_bibliographic == false` only circulation is requested.
    async fn lookup(
        &self,
        identifiers: &[String],
        include_bibliographic: bool,
    ) -> Result<Vec<TitleRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_page_token_serialization() {
        let token = PageToken::Number(3);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"{"kind":"number","value":3}"#);

        let url: PageToken =
            serde_json::from_str(r#"{"kind":"url","value":"https://x/y?page=2"}"#).unwrap();
        assert_eq!(url, PageToken::Url("https://x/y?page=2".to_string()));
    }

    #[test]
    fn test_removed_circulation() {
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let data = CirculationData::removed(IdentifierData::new("Axis 360 ID", "0001"), when);

        assert_eq!(data.licenses_owned, 0);
        assert_eq!(data.licenses_available, 0);
        assert_eq!(data.status, LicenseStatus::Removed);
        assert!(!data.is_available());
    }

    #[test]
    fn test_license_source_policy() {
        let policy = ReplacementPolicy::from_license_source();
        assert!(!policy.identifiers);
        assert!(policy.subjects && policy.contributions && policy.formats && policy.links);
    }
}
