//! Error types for the Boundless provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Boundless provider errors
#[derive(Error, Debug)]
pub enum BoundlessError {
    /// API request returned an error status
    #[error("Boundless API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    /// The API answered 200 but reported a failure in its status block
    #[error("Boundless rejected the request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Bridge error
    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for Boundless operations
pub type Result<T> = std::result::Result<T, BoundlessError>;

impl From<BoundlessError> for BridgeError {
    fn from(error: BoundlessError) -> Self {
        match error {
            BoundlessError::ApiError {
                status_code,
                message,
            } => BridgeError::HttpStatus {
                status: status_code,
                message,
            },
            BoundlessError::Rejected { code, message } => {
                BridgeError::OperationFailed(format!("Boundless code {}: {}", code, message))
            }
            BoundlessError::ParseError(msg) => BridgeError::Serialization(msg),
            BoundlessError::BridgeError(e) => e,
        }
    }
}
