//! HTTP Client Abstraction
//!
//! Provider connectors talk to vendor APIs through [`HttpClient`] so feeds can
//! be exercised without a network. Only what catalog feeds need is modeled:
//! authenticated GETs with query parameters, form POSTs and a retry policy
//! shared by every vendor.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Request to a vendor API, built fluently
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.header("Authorization", format!("Bearer {}", token.into()))
    }

    /// Append a query parameter. Values are encoded by the client.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Vendor feeds answer JSON when asked for it.
    pub fn accept_json(self) -> Self {
        self.header("Accept", "application/json")
    }

    /// URL-encoded form body, as token endpoints expect.
    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        let encoded = fields
            .iter()
            .map(|(k, v)| format!("{}={}", encode_form(k), encode_form(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.body = Some(Bytes::from(encoded));
        self.headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

fn encode_form(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            BridgeError::Serialization(format!("JSON deserialization failed: {}", e))
        })
    }

    /// Get response body as UTF-8 string
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| BridgeError::Serialization(format!("Invalid UTF-8: {}", e)))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 5xx and 429, the statuses worth asking again.
    pub fn is_retryable(&self) -> bool {
        (500..600).contains(&self.status) || self.status == 429
    }

    /// Turn a non-2xx response into [`BridgeError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = self
            .text()
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect::<String>();
        Err(BridgeError::HttpStatus {
            status: self.status,
            message,
        })
    }
}

/// In-call retries for a single vendor request. Run-level retries happen on
/// the task queue on top of these.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Implementations map transport failures onto the transient variants of
/// [`BridgeError`] (`Timeout`, `Connection`) so callers can decide whether a
/// failed call is worth retrying.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest};
///
/// async fn first_page(client: &dyn HttpClient) -> Result<HttpResponse> {
///     let request = HttpRequest::new(HttpMethod::Get, "https://vendor.test/titles")
///         .bearer_token("token")
///         .query("page", "1")
///         .accept_json();
///
///     client.execute(request).await?.error_for_status()
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send once. Non-2xx responses come back as `Ok`; use
    /// [`HttpResponse::error_for_status`] to convert them.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Send, retrying transient failures per `policy`. The default sends once.
    async fn execute_with_retry(
        &self,
        request: HttpRequest,
        policy: RetryPolicy,
    ) -> Result<HttpResponse> {
        let _ = policy;
        self.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_request_builder() {
        let request = HttpRequest::new(HttpMethod::Get, "https://vendor.test/titles")
            .bearer_token("secret")
            .query("page", "2")
            .query("modifiedSince", "2024-01-01T00:00:00Z")
            .accept_json()
            .timeout(Duration::from_secs(30));

        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Bearer secret".to_string())
        );
        assert_eq!(request.headers.get("Accept"), Some(&"application/json".to_string()));
        assert_eq!(request.query.len(), 2);
        assert!(request.body.is_none());
    }

    #[test]
    fn test_form_body_is_encoded() {
        let request = HttpRequest::new(HttpMethod::Post, "https://vendor.test/token")
            .form(&[("grant_type", "client_credentials"), ("scope", "websiteid:1 authorizationname:x")]);

        assert_eq!(
            request.body.as_deref(),
            Some(&b"grant_type=client_credentials&scope=websiteid%3A1+authorizationname%3Ax"[..])
        );
    }

    #[test]
    fn test_retryable_statuses() {
        let response = |status| HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        };

        assert!(response(503).is_retryable());
        assert!(response(429).is_retryable());
        assert!(!response(404).is_retryable());
        assert!(response(204).is_success());
    }

    #[test]
    fn test_error_for_status() {
        let response = HttpResponse {
            status: 502,
            headers: HashMap::new(),
            body: Bytes::from("bad gateway"),
        };

        let err = response.error_for_status().unwrap_err();
        assert!(err.is_transient());
        match err {
            BridgeError::HttpStatus { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }
}
