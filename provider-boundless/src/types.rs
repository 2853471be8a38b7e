//! Boundless API response types
//!
//! Data structures for deserializing the `titleLicense/v3` and
//! `availability/v3` JSON responses.

use serde::{Deserialize, Serialize};

/// Status block present on every response. Code 0 means success.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiStatus {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub total_count: u64,
    pub total_page: u32,
}

/// `titleLicense/v3` response.
///
/// Titles are kept as raw JSON so a single malformed entry can be skipped
/// without losing the page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleLicenseResponse {
    pub status: ApiStatus,
    pub pagination: Option<Pagination>,
    #[serde(default)]
    pub titles: Vec<serde_json::Value>,
}

/// One licensed title in a `titleLicense/v3` page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleLicense {
    pub title_id: String,

    /// Whether the library still holds a license for the title
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// `availability/v3` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub status: ApiStatus,
    #[serde(default)]
    pub titles: Vec<AvailabilityTitle>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityTitle {
    pub title_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sub_title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    /// Publication date (`YYYY-MM-DD`)
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub narrators: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub availability: Option<Availability>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub total_copies: i64,
    pub available_copies: i64,
    #[serde(default)]
    pub reserved_copies: i64,
    #[serde(default)]
    pub holds_queue_size: i64,
    /// Last time the provider recalculated these numbers (RFC 3339)
    #[serde(default)]
    pub update_date: Option<String>,
}
