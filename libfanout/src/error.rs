//! Error types for Fanout

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Content item not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FanoutError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanoutError::InvalidInput(_) | FanoutError::NotFound(_) => 3,
            FanoutError::Platform(PlatformError::Authentication(_)) => 2,
            FanoutError::Config(_) | FanoutError::Store(_) => 2,
            FanoutError::Platform(_) | FanoutError::Queue(_) => 1,
        }
    }

    /// Whether this error means the persistence layer could not be reached
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, FanoutError::Store(e) if e.is_unavailable())
    }

    /// Whether a write lost a race against another writer of the same item
    pub fn is_conflict(&self) -> bool {
        matches!(self, FanoutError::Store(StoreError::Conflict(_)))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Concurrent update of item {0}")]
    Conflict(String),
}

impl StoreError {
    /// Connection-level failures, and a database held locked by another
    /// writer, mean the store cannot take writes right now. Everything else
    /// is a data problem with a single item.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::SqlxError(sqlx::Error::Database(e)) => is_busy(e.as_ref()),
            StoreError::SqlxError(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            StoreError::MigrationError(_) | StoreError::Corrupt(_) | StoreError::Conflict(_) => {
                false
            }
        }
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, extended codes included
fn is_busy(error: &dyn sqlx::error::DatabaseError) -> bool {
    error
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Platform not configured: {0}")]
    NotConfigured(String),
}

impl PlatformError {
    /// Transient errors are retried by the retry scheduler; everything else
    /// is a permanent failure for that platform.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Network(_) | PlatformError::RateLimit(_) | PlatformError::Posting(_) => {
                true
            }
            PlatformError::Authentication(_)
            | PlatformError::Validation(_)
            | PlatformError::NotConfigured(_) => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("publication queue is closed")]
    Closed,
}
