//! Boundless API connector implementation
//!
//! Implements `CatalogFeed` over the Boundless vendor API.

use async_trait::async_trait;
use bridge_traits::catalog::{
    BibliographicData, CatalogFeed, CirculationData, Contributor, FeedEntry, FeedPage,
    FeedRequest, IdentifierData, LicenseStatus, PageToken, RejectedEntry, TitleRecord,
};
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::BoundlessError;
use crate::types::{AvailabilityResponse, AvailabilityTitle, TitleLicense, TitleLicenseResponse};

/// Production API base URL
const BOUNDLESS_API_BASE: &str = "https://axis360api.baker-taylor.com/Services/VendorAPI";

/// Identifier type of Boundless title ids
pub const BOUNDLESS_ID_TYPE: &str = "Axis 360 ID";

/// Most title ids the availability endpoint accepts at once
const LOOKUP_BATCH_SIZE: usize = 125;

/// Timestamp format the API expects for `modifiedSince`
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Boundless catalog feed for one library account.
///
/// Titles are listed with `titleLicense/v3`, one numbered page at a time.
/// Detailed records come from `availability/v3`.
///
/// # Example
///
/// ```ignore
/// use provider_boundless::BoundlessFeed;
///
/// let feed = BoundlessFeed::new(http_client, "library-id", access_token);
/// let page = feed.fetch_page(FeedRequest { page: None, modified_since: None, page_size: 100 }).await?;
/// ```
pub struct BoundlessFeed {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    library_id: String,
    access_token: String,
    retry: RetryPolicy,
}

impl BoundlessFeed {
    /// Create a feed against the production API.
    ///
    /// # Arguments
    ///
    /// * `http_client` - HTTP client implementation
    /// * `library_id` - Boundless library identifier of the account
    /// * `access_token` - bearer token obtained by the host application
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        library_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: BOUNDLESS_API_BASE.to_string(),
            library_id: library_id.into(),
            access_token: access_token.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Point the feed at another deployment (QA servers, test doubles).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self, endpoint: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, format!("{}/{}", self.base_url, endpoint))
            .bearer_token(&self.access_token)
            .header("library", &self.library_id)
            .accept_json()
            .timeout(Duration::from_secs(30))
    }

    /// Send a request and decode a successful JSON body.
    async fn get_json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let response: HttpResponse = self
            .http_client
            .execute_with_retry(request, self.retry.clone())
            .await?;

        if !response.is_success() {
            warn!("Boundless request failed: status={}", response.status);
            return Err(BoundlessError::ApiError {
                status_code: response.status,
                message: response.text().unwrap_or_default(),
            }
            .into());
        }

        serde_json::from_slice(&response.body).map_err(|e| {
            BoundlessError::ParseError(format!("Failed to parse response: {}", e)).into()
        })
    }

    /// Split raw titles into usable entries and rejects.
    fn convert_titles(titles: Vec<serde_json::Value>) -> (Vec<FeedEntry>, Vec<RejectedEntry>) {
        let mut entries = Vec::with_capacity(titles.len());
        let mut rejected = Vec::new();

        for raw in titles {
            match serde_json::from_value::<TitleLicense>(raw.clone()) {
                Ok(license) if !license.title_id.trim().is_empty() => entries.push(FeedEntry {
                    identifier: license.title_id,
                    active: Some(license.active),
                    date_added: None,
                    raw,
                }),
                Ok(_) => rejected.push(RejectedEntry {
                    reason: "empty titleId".to_string(),
                    raw,
                }),
                Err(e) => rejected.push(RejectedEntry {
                    reason: e.to_string(),
                    raw,
                }),
            }
        }

        (entries, rejected)
    }

    fn convert_title(title: AvailabilityTitle, include_bibliographic: bool) -> TitleRecord {
        let identifier = IdentifierData::new(BOUNDLESS_ID_TYPE, &title.title_id);

        let circulation = title.availability.as_ref().map(|availability| {
            let status = if availability.available_copies > 0 {
                LicenseStatus::Available
            } else {
                LicenseStatus::Unavailable
            };
            CirculationData {
                identifier: identifier.clone(),
                licenses_owned: availability.total_copies,
                licenses_available: availability.available_copies,
                licenses_reserved: availability.reserved_copies,
                patrons_in_hold_queue: availability.holds_queue_size,
                status,
                last_checked: availability
                    .update_date
                    .as_deref()
                    .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
                    .map(|date| date.with_timezone(&Utc)),
            }
        });

        let bibliographic = include_bibliographic.then(|| {
            let mut data = BibliographicData::new(identifier.clone());
            data.title = title.title;
            data.subtitle = title.sub_title;
            data.language = title.language;
            data.publisher = title.publisher;
            data.published = title
                .publication_date
                .as_deref()
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|date| date.and_utc());
            data.identifiers = title
                .isbn
                .into_iter()
                .map(|isbn| IdentifierData::new("ISBN", isbn))
                .collect();
            data.contributors = title
                .authors
                .into_iter()
                .map(|name| Contributor {
                    name,
                    role: "Author".to_string(),
                })
                .chain(title.narrators.into_iter().map(|name| Contributor {
                    name,
                    role: "Narrator".to_string(),
                }))
                .collect();
            data.medium = Some(
                if title.formats.iter().any(|f| f.eq_ignore_ascii_case("Acoustik")) {
                    "Audio"
                } else {
                    "Book"
                }
                .to_string(),
            );
            data.subjects = title.subjects;
            data.formats = title.formats;
            data.links = title.image_url.into_iter().collect();
            data
        });

        TitleRecord {
            identifier,
            bibliographic,
            circulation,
        }
    }
}

#[async_trait]
impl CatalogFeed for BoundlessFeed {
    fn identifier_type(&self) -> &str {
        BOUNDLESS_ID_TYPE
    }

    fn lookup_batch_size(&self) -> usize {
        LOOKUP_BATCH_SIZE
    }

    #[instrument(skip(self), fields(page = ?request.page))]
    async fn fetch_page(&self, request: FeedRequest) -> Result<FeedPage> {
        let page_number = match &request.page {
            None => 1,
            Some(PageToken::Number(number)) => *number,
            Some(other) => {
                return Err(BridgeError::OperationFailed(format!(
                    "Boundless feeds are paginated by number, got {}",
                    other
                )))
            }
        };

        let mut http_request = self
            .request("titleLicense/v3")
            .query("page", page_number.to_string())
            .query("pageSize", request.page_size.to_string());
        if let Some(since) = request.modified_since {
            http_request = http_request.query("modifiedSince", since.format(TIME_FORMAT).to_string());
        }

        let response: TitleLicenseResponse = self.get_json(http_request).await?;
        if !response.status.is_success() {
            return Err(BoundlessError::Rejected {
                code: response.status.code,
                message: response.status.message.unwrap_or_default(),
            }
            .into());
        }
        let pagination = response.pagination.ok_or_else(|| {
            BoundlessError::ParseError("titleLicense response without pagination".to_string())
        })?;

        let (entries, rejected) = Self::convert_titles(response.titles);
        if !rejected.is_empty() {
            warn!(count = rejected.len(), "Malformed titles in Boundless page");
        }

        let next_page = (pagination.current_page < pagination.total_page)
            .then_some(PageToken::Number(pagination.current_page + 1));

        info!(
            "Fetched Boundless page {}/{} with {} titles",
            pagination.current_page,
            pagination.total_page,
            entries.len()
        );

        Ok(FeedPage {
            entries,
            rejected,
            current_page: pagination.current_page,
            total_pages: pagination.total_page,
            next_page,
        })
    }

    #[instrument(skip(self, identifiers), fields(count = identifiers.len()))]
    async fn lookup(
        &self,
        identifiers: &[String],
        include_bibliographic: bool,
    ) -> Result<Vec<TitleRecord>> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(identifiers.len());
        for batch in identifiers.chunks(LOOKUP_BATCH_SIZE) {
            let http_request = self
                .request("availability/v3")
                .query("titleIds", batch.join(","));
            let response: AvailabilityResponse = self.get_json(http_request).await?;
            if !response.status.is_success() {
                return Err(BoundlessError::Rejected {
                    code: response.status.code,
                    message: response.status.message.unwrap_or_default(),
                }
                .into());
            }

            debug!(requested = batch.len(), returned = response.titles.len(), "Availability batch");
            records.extend(
                response
                    .titles
                    .into_iter()
                    .map(|title| Self::convert_title(title, include_bibliographic)),
            );
        }

        Ok(records)
    }
}
