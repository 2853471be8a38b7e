use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverdriveError {
    #[error("OverDrive API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Unsupported page token: {0}")]
    UnsupportedPageToken(String),

    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, OverdriveError>;

impl From<OverdriveError> for BridgeError {
    fn from(error: OverdriveError) -> Self {
        match error {
            OverdriveError::ApiError {
                status_code,
                message,
            } => BridgeError::HttpStatus {
                status: status_code,
                message,
            },
            OverdriveError::UnsupportedPageToken(token) => {
                BridgeError::OperationFailed(format!("Unsupported page token: {}", token))
            }
            OverdriveError::ParseError(msg) => BridgeError::Serialization(msg),
            OverdriveError::BridgeError(e) => e,
        }
    }
}
