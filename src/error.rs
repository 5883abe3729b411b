//! Error handling for the reasoning engine

use thiserror::Error;

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A parser could not read the file. The document is marked `failed`.
    #[error("corrupted input {path}: {message}")]
    CorruptedInput { path: String, message: String },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Deadline or cancellation token tripped; partial state was rolled back.
    #[error("cancelled while {resource}")]
    Cancelled { resource: String },

    /// Fatal at startup: dimension mismatch, unknown format, bad thresholds.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors from the chat and embedding providers
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Timeout, 5xx or rate limit. Retried with capped exponential backoff.
    #[error("transient provider failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    /// 4xx from the provider. Not retried.
    #[error("permanent provider failure (status {status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("provider request timed out")]
    Timeout,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors from the persistent store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Constraint violation (UNIQUE or FK race). Retried once per transaction.
    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("row decode failed: {0}")]
    Decode(String),

    /// The vec_chunks table was created with a different dimension.
    #[error("vector index dimension is {existing}, configured {configured}; rebuild the store to change models")]
    VectorDimension { existing: usize, configured: usize },
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = e.status() {
            let code = status.as_u16();
            if status.is_server_error() || code == 429 || code == 408 {
                ProviderError::Transient {
                    status: Some(code),
                    message: e.to_string(),
                }
            } else {
                ProviderError::Permanent {
                    status: code,
                    message: e.to_string(),
                }
            }
        } else {
            // Connection-level failures are worth another attempt
            ProviderError::Transient {
                status: None,
                message: e.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Provider(ProviderError::from(e))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(StoreError::from_sqlx(e))
    }
}

impl StoreError {
    /// Classify a sqlx error, pulling constraint violations out as conflicts.
    pub fn from_sqlx(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

impl EngineError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Provider(ProviderError::Transient { .. })
                | EngineError::Provider(ProviderError::Timeout)
                | EngineError::Store(StoreError::Conflict(_))
        )
    }

    /// Get error category for logging and the CLI exit code
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::CorruptedInput { .. } => "input",
            EngineError::Provider(_) => "provider",
            EngineError::Store(_) => "store",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::InvalidConfig(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Generic(_) => "generic",
        }
    }
}
