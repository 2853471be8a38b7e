use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Remote returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Timeouts, dropped connections, 5xx responses and 429 throttling are
    /// transient. Authentication failures and other 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Timeout(_) | BridgeError::Connection(_) => true,
            BridgeError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::Timeout("read".into()).is_transient());
        assert!(BridgeError::Connection("reset".into()).is_transient());
        assert!(BridgeError::HttpStatus {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(BridgeError::HttpStatus {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());

        assert!(!BridgeError::HttpStatus {
            status: 401,
            message: "unauthorized".into()
        }
        .is_transient());
        assert!(!BridgeError::OperationFailed("bad".into()).is_transient());
        assert!(!BridgeError::Serialization("oops".into()).is_transient());
    }
}
