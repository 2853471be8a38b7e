//! OverDrive API response types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

/// One page of `/v1/collections/{token}/products`.
///
/// Products stay raw JSON so a malformed one does not fail the page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductsResponse {
    #[serde(default)]
    pub products: Vec<serde_json::Value>,
    #[serde(default)]
    pub links: HashMap<String, Link>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub total_items: Option<u64>,
}

impl ProductsResponse {
    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links.get(rel).map(|link| link.href.as_str())
    }

    /// 1-based number of this page, derived from offset and limit.
    pub fn current_page(&self) -> u32 {
        match (self.offset, self.limit) {
            (Some(offset), Some(limit)) if limit > 0 => offset / limit + 1,
            _ => 1,
        }
    }

    /// Page count, or 0 when the response does not say.
    pub fn total_pages(&self) -> u32 {
        match (self.total_items, self.limit) {
            (Some(total), Some(limit)) if limit > 0 => {
                u32::try_from(total.div_ceil(u64::from(limit))).unwrap_or(u32::MAX)
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// When the product entered the collection (RFC 3339)
    #[serde(default)]
    pub date_added: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// `/v2/collections/{token}/availability?products=...`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAvailabilityResponse {
    #[serde(default)]
    pub availability: Vec<ProductAvailability>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductAvailability {
    pub reserve_id: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub copies_owned: i64,
    #[serde(default)]
    pub copies_available: i64,
    #[serde(default)]
    pub number_of_holds: i64,
}

/// `/v1/collections/{token}/products/{id}/metadata`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMetadata {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub languages: Vec<Language>,
    #[serde(default)]
    pub creators: Vec<Creator>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub formats: Vec<Format>,
    #[serde(default)]
    pub images: HashMap<String, Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Language {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Creator {
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subject {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Format {
    pub id: String,
    #[serde(default)]
    pub identifiers: Vec<FormatIdentifier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_products_page_numbers() {
        let json = r#"{
            "limit": 25,
            "offset": 50,
            "totalItems": 101,
            "products": [],
            "links": {"next": {"href": "https://api.test/v1/collections/c1/products?offset=75&limit=25"}}
        }"#;

        let response: ProductsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.current_page(), 3);
        assert_eq!(response.total_pages(), 5);
        assert!(response.link("next").is_some());
        assert!(response.link("prev").is_none());
    }

    #[test]
    fn test_products_without_paging_fields() {
        let response: ProductsResponse = serde_json::from_str(r#"{"products": []}"#).unwrap();
        assert_eq!(response.current_page(), 1);
        assert_eq!(response.total_pages(), 0);
    }

    #[test]
    fn test_deserialize_metadata() {
        let json = r#"{
            "id": "3896665d-9d81-4cac-bd43-ffc5066de1f5",
            "title": "The Hobbit",
            "publishDate": "2012-09-18T00:00:00Z",
            "languages": [{"code": "en", "name": "English"}],
            "creators": [{"role": "Author", "name": "J. R. R. Tolkien"}],
            "subjects": [{"value": "Fantasy"}],
            "formats": [{"id": "ebook-epub-adobe", "identifiers": [{"type": "ISBN", "value": "9780547951973"}]}]
        }"#;

        let metadata: ProductMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.languages[0].code, "en");
        assert_eq!(metadata.formats[0].identifiers[0].kind, "ISBN");
        assert!(metadata.images.is_empty());
    }
}
