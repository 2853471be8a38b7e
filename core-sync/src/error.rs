use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Lock {key} is held by {holder}")]
    LockNotAcquired { key: String, holder: String },

    #[error("Timed out after {waited_ms}ms waiting for lock {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("modified_since and start_time are required")]
    MissingContinuation,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid member {member:?} in set {key}: {reason}")]
    Deserialization {
        key: String,
        member: String,
        reason: String,
    },

    #[error("Source {0} not found")]
    SourceNotFound(String),

    #[error("Provider error: {message}")]
    Provider { message: String, transient: bool },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Reconciliation {chord_id} not found")]
    ChordNotFound { chord_id: String },

    #[error("Invalid ID: {0}")]
    InvalidId(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Whether the unit of work that raised this error should be retried.
    ///
    /// Only provider-side timeouts and bad upstream responses qualify.
    /// Everything else fails the unit of work on the first attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Provider { transient: true, .. })
    }
}

impl From<BridgeError> for SyncError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::DatabaseError(message) => SyncError::Store(message),
            BridgeError::NotAvailable(message) => SyncError::Configuration(message),
            other => SyncError::Provider {
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(error: sqlx::Error) -> Self {
        SyncError::Database(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
