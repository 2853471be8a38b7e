//! OverDrive API connector implementation
//!
//! Implements `CatalogFeed` over the OverDrive collection APIs.

use async_trait::async_trait;
use bridge_traits::catalog::{
    BibliographicData, CatalogFeed, CirculationData, Contributor, FeedEntry, FeedPage,
    FeedRequest, IdentifierData, LicenseStatus, PageToken, RejectedEntry, TitleRecord,
};
use bridge_traits::error::Result;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::OverdriveError;
use crate::types::{
    BulkAvailabilityResponse, ProductAvailability, ProductMetadata, Product, ProductsResponse,
};

const OVERDRIVE_API_BASE: &str = "https://api.overdrive.com";

/// Identifier type of OverDrive product ids
pub const OVERDRIVE_ID_TYPE: &str = "Overdrive ID";

/// Most products the bulk availability endpoint accepts at once
const LOOKUP_BATCH_SIZE: usize = 25;

/// Newest additions first, so an incremental import can stop at the
/// first page older than its window.
const PRODUCT_SORT: &str = "dateAdded:desc";

/// Re-encode the query values of a server-provided link.
///
/// OverDrive returns `next` links with raw braces and colons in query
/// values, which it then refuses to accept.
pub fn make_link_safe(link: &str) -> String {
    let Some((base, query)) = link.split_once('?') else {
        return link.to_string();
    };

    let params: Vec<String> = query
        .split('&')
        .filter(|param| !param.is_empty())
        .map(|param| match param.split_once('=') {
            Some((key, value)) => {
                let decoded = urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string());
                format!("{}={}", key, urlencoding::encode(&decoded))
            }
            None => param.to_string(),
        })
        .collect();

    format!("{}?{}", base, params.join("&"))
}

/// OverDrive catalog feed for one collection (a library account or one of
/// its advantage accounts).
pub struct OverdriveFeed {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    collection_token: String,
    access_token: String,
    retry: RetryPolicy,
}

impl OverdriveFeed {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        collection_token: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: OVERDRIVE_API_BASE.to_string(),
            collection_token: collection_token.into(),
            access_token: access_token.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn first_page_url(&self, page_size: u32) -> String {
        format!(
            "{}/v1/collections/{}/products?sort={}&limit={}",
            self.base_url,
            urlencoding::encode(&self.collection_token),
            urlencoding::encode(PRODUCT_SORT),
            page_size
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        let request = HttpRequest::new(HttpMethod::Get, url)
            .bearer_token(&self.access_token)
            .accept_json()
            .timeout(Duration::from_secs(120));

        let response = self
            .http_client
            .execute_with_retry(request, self.retry.clone())
            .await?;

        if !response.is_success() {
            warn!("OverDrive request failed: status={}", response.status);
            return Err(OverdriveError::ApiError {
                status_code: response.status,
                message: response.text().unwrap_or_default(),
            }
            .into());
        }

        serde_json::from_slice(&response.body)
            .map_err(|e| OverdriveError::ParseError(e.to_string()).into())
    }

    fn convert_products(products: Vec<serde_json::Value>) -> (Vec<FeedEntry>, Vec<RejectedEntry>) {
        let mut entries = Vec::with_capacity(products.len());
        let mut rejected = Vec::new();

        for raw in products {
            let product = match serde_json::from_value::<Product>(raw.clone()) {
                Ok(product) => product,
                Err(e) => {
                    rejected.push(RejectedEntry {
                        reason: e.to_string(),
                        raw,
                    });
                    continue;
                }
            };

            let date_added = match product.date_added.as_deref() {
                Some(value) => match DateTime::parse_from_rfc3339(value) {
                    Ok(date) => Some(date.with_timezone(&Utc)),
                    Err(e) => {
                        warn!(id = %product.id, date_added = value, error = %e, "Unparseable dateAdded");
                        None
                    }
                },
                None => None,
            };

            entries.push(FeedEntry {
                identifier: product.id,
                active: None,
                date_added,
                raw,
            });
        }

        (entries, rejected)
    }

    async fn availability(&self, batch: &[String]) -> Result<HashMap<String, ProductAvailability>> {
        let url = format!(
            "{}/v2/collections/{}/availability?products={}",
            self.base_url,
            urlencoding::encode(&self.collection_token),
            urlencoding::encode(&batch.join(","))
        );
        let response: BulkAvailabilityResponse = self.get_json(url).await?;

        Ok(response
            .availability
            .into_iter()
            .map(|item| (item.reserve_id.to_lowercase(), item))
            .collect())
    }

    async fn metadata(&self, id: &str) -> Result<ProductMetadata> {
        let url = format!(
            "{}/v1/collections/{}/products/{}/metadata",
            self.base_url,
            urlencoding::encode(&self.collection_token),
            urlencoding::encode(id)
        );
        self.get_json(url).await
    }

    fn convert_availability(identifier: &IdentifierData, item: &ProductAvailability) -> CirculationData {
        let status = if item.available && item.copies_available > 0 {
            LicenseStatus::Available
        } else {
            LicenseStatus::Unavailable
        };
        CirculationData {
            identifier: identifier.clone(),
            licenses_owned: item.copies_owned,
            licenses_available: item.copies_available,
            licenses_reserved: 0,
            patrons_in_hold_queue: item.number_of_holds,
            status,
            last_checked: None,
        }
    }

    fn convert_metadata(identifier: &IdentifierData, metadata: ProductMetadata) -> BibliographicData {
        let mut data = BibliographicData::new(identifier.clone());
        data.title = metadata.title;
        data.subtitle = metadata.subtitle;
        data.publisher = metadata.publisher;
        data.published = metadata
            .publish_date
            .as_deref()
            .and_then(|date| DateTime::parse_from_rfc3339(date).ok())
            .map(|date| date.with_timezone(&Utc));
        data.language = metadata.languages.into_iter().next().map(|l| l.code);
        data.medium = metadata.media_type;
        data.contributors = metadata
            .creators
            .into_iter()
            .map(|creator| Contributor {
                name: creator.name,
                role: creator.role,
            })
            .collect();
        data.subjects = metadata.subjects.into_iter().map(|s| s.value).collect();
        for format in metadata.formats {
            for id in format.identifiers {
                let equivalent = IdentifierData::new(id.kind, id.value);
                if !data.identifiers.contains(&equivalent) {
                    data.identifiers.push(equivalent);
                }
            }
            data.formats.push(format.id);
        }
        let mut images: Vec<(String, String)> = metadata
            .images
            .into_iter()
            .map(|(rel, link)| (rel, link.href))
            .collect();
        images.sort();
        data.links = images.into_iter().map(|(_, href)| href).collect();
        data
    }
}

#[async_trait]
impl CatalogFeed for OverdriveFeed {
    fn identifier_type(&self) -> &str {
        OVERDRIVE_ID_TYPE
    }

    fn lookup_batch_size(&self) -> usize {
        LOOKUP_BATCH_SIZE
    }

    /// OverDrive has no modification filter on the product list; the
    /// window is enforced by early termination on `dateAdded` instead.
    #[instrument(skip(self), fields(page = ?request.page))]
    async fn fetch_page(&self, request: FeedRequest) -> Result<FeedPage> {
        let url = match &request.page {
            None => self.first_page_url(request.page_size),
            Some(PageToken::Url(link)) => make_link_safe(link),
            Some(other) => {
                return Err(OverdriveError::UnsupportedPageToken(other.to_string()).into())
            }
        };

        let response: ProductsResponse = self.get_json(url).await?;
        let current_page = response.current_page();
        let total_pages = response.total_pages();
        let next_page = response
            .link("next")
            .map(|link| PageToken::Url(make_link_safe(link)));

        let (entries, rejected) = Self::convert_products(response.products);
        if !rejected.is_empty() {
            warn!(count = rejected.len(), "Malformed products in OverDrive page");
        }

        info!(
            "Fetched OverDrive page {}/{} with {} products",
            current_page,
            total_pages,
            entries.len()
        );

        Ok(FeedPage {
            entries,
            rejected,
            current_page,
            total_pages,
            next_page,
        })
    }

    #[instrument(skip(self, identifiers), fields(count = identifiers.len()))]
    async fn lookup(
        &self,
        identifiers: &[String],
        include_bibliographic: bool,
    ) -> Result<Vec<TitleRecord>> {
        let mut records = Vec::with_capacity(identifiers.len());

        for batch in identifiers.chunks(LOOKUP_BATCH_SIZE) {
            let availability = self.availability(batch).await?;
            debug!(requested = batch.len(), returned = availability.len(), "Availability batch");

            for id in batch {
                let identifier = IdentifierData::new(OVERDRIVE_ID_TYPE, id);
                let circulation = availability
                    .get(&id.to_lowercase())
                    .map(|item| Self::convert_availability(&identifier, item));
                let bibliographic = if include_bibliographic {
                    Some(Self::convert_metadata(&identifier, self.metadata(id).await?))
                } else {
                    None
                };

                records.push(TitleRecord {
                    identifier,
                    bibliographic,
                    circulation,
                });
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::BridgeError;
    use bridge_traits::http::HttpResponse;
    use bytes::Bytes;
    use chrono::TimeZone;
    use mockall::mock;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
        }
    }

    fn json_response(status: u16, body: &str) -> Result<HttpResponse> {
        Ok(HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    fn feed(mock_http: MockHttpClient) -> OverdriveFeed {
        OverdriveFeed::new(Arc::new(mock_http), "col1", "test_token").with_base_url("https://od.test")
    }

    fn request(page: Option<PageToken>) -> FeedRequest {
        FeedRequest {
            page,
            modified_since: None,
            page_size: 25,
        }
    }

    #[test]
    fn test_make_link_safe() {
        let link = "https://od.test/v1/collections/col1/products?sort=dateAdded:desc&limit=25&offset=25";
        assert_eq!(
            make_link_safe(link),
            "https://od.test/v1/collections/col1/products?sort=dateAdded%3Adesc&limit=25&offset=25"
        );

        let encoded = "https://od.test/p?q=%7Bx%7D";
        assert_eq!(make_link_safe(encoded), encoded);
        assert_eq!(make_link_safe("https://od.test/p"), "https://od.test/p");
    }

    #[tokio::test]
    async fn test_fetch_first_page() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(
                req.url,
                "https://od.test/v1/collections/col1/products?sort=dateAdded%3Adesc&limit=25"
            );
            assert!(req.headers.contains_key("Authorization"));
            json_response(
                200,
                r#"{
                    "limit": 25, "offset": 0, "totalItems": 60,
                    "products": [
                        {"id": "A1", "title": "First", "dateAdded": "2024-03-01T10:00:00Z"},
                        {"id": "A2", "dateAdded": "not a date"},
                        {"title": "No id"}
                    ],
                    "links": {"next": {"href": "https://od.test/v1/collections/col1/products?sort=dateAdded:desc&limit=25&offset=25"}}
                }"#,
            )
        });

        let page = feed(mock_http).fetch_page(request(None)).await.unwrap();

        assert_eq!(page.current_page, 1);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.rejected.len(), 1);
        assert_eq!(page.entries[0].active, None);
        assert_eq!(
            page.entries[0].date_added,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(page.entries[1].date_added, None);
        assert_eq!(
            page.next_page,
            Some(PageToken::Url(
                "https://od.test/v1/collections/col1/products?sort=dateAdded%3Adesc&limit=25&offset=25"
                    .to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_follows_link_and_stops_without_next() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert!(req.url.ends_with("offset=50"));
            json_response(
                200,
                r#"{"limit": 25, "offset": 50, "totalItems": 60, "products": [{"id": "C1"}], "links": {}}"#,
            )
        });

        let page = feed(mock_http)
            .fetch_page(request(Some(PageToken::Url(
                "https://od.test/v1/collections/col1/products?offset=50".to_string(),
            ))))
            .await
            .unwrap();

        assert_eq!(page.current_page, 3);
        assert_eq!(page.next_page, None);
    }

    #[tokio::test]
    async fn test_number_token_is_rejected() {
        let result = feed(MockHttpClient::new())
            .fetch_page(request(Some(PageToken::Number(2))))
            .await;

        assert!(matches!(result, Err(BridgeError::OperationFailed(_))));
    }

    #[tokio::test]
    async fn test_throttling_is_transient() {
        let mut mock_http = MockHttpClient::new();
        mock_http
            .expect_execute()
            .times(1)
            .returning(|_| json_response(429, "Too Many Requests"));

        let err = feed(mock_http).fetch_page(request(None)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_lookup_circulation_only() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert!(req.url.contains("/v2/collections/col1/availability?products=A1%2CA2"));
            json_response(
                200,
                r#"{"availability": [
                    {"reserveId": "a1", "available": true, "copiesOwned": 3, "copiesAvailable": 2, "numberOfHolds": 0}
                ]}"#,
            )
        });

        let records = feed(mock_http)
            .lookup(&["A1".to_string(), "A2".to_string()], false)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let circulation = records[0].circulation.as_ref().unwrap();
        assert_eq!(circulation.licenses_owned, 3);
        assert_eq!(circulation.status, LicenseStatus::Available);
        assert!(records[0].bibliographic.is_none());
        assert!(records[1].circulation.is_none());
    }

    #[tokio::test]
    async fn test_lookup_with_metadata() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(2).returning(|req| {
            if req.url.contains("/availability") {
                json_response(
                    200,
                    r#"{"availability": [
                        {"reserveId": "A1", "available": false, "copiesOwned": 1, "copiesAvailable": 0, "numberOfHolds": 5}
                    ]}"#,
                )
            } else {
                assert!(req.url.ends_with("/v1/collections/col1/products/A1/metadata"));
                json_response(
                    200,
                    r#"{
                        "id": "A1",
                        "title": "The Hobbit",
                        "mediaType": "eBook",
                        "languages": [{"code": "en"}],
                        "creators": [{"role": "Author", "name": "J. R. R. Tolkien"}],
                        "formats": [
                            {"id": "ebook-epub-adobe", "identifiers": [{"type": "ISBN", "value": "9780547951973"}]},
                            {"id": "ebook-kindle", "identifiers": [{"type": "ISBN", "value": "9780547951973"}]}
                        ],
                        "images": {"cover": {"href": "https://img.test/a1.jpg"}}
                    }"#,
                )
            }
        });

        let records = feed(mock_http).lookup(&["A1".to_string()], true).await.unwrap();

        let record = &records[0];
        assert_eq!(
            record.circulation.as_ref().unwrap().status,
            LicenseStatus::Unavailable
        );
        let bibliographic = record.bibliographic.as_ref().unwrap();
        assert_eq!(bibliographic.title.as_deref(), Some("The Hobbit"));
        assert_eq!(bibliographic.language.as_deref(), Some("en"));
        assert_eq!(bibliographic.formats.len(), 2);
        assert_eq!(bibliographic.identifiers.len(), 1);
        assert_eq!(bibliographic.links, vec!["https://img.test/a1.jpg".to_string()]);
    }
}
