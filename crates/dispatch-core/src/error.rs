//! Error types for the dispatch system

use thiserror::Error;

/// Main error type for all dispatch operations
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Contact data error: {0}")]
    ContactData(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// True for errors that must never be retried automatically and must
    /// surface to the caller before any row is written.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// True for errors isolated to a single queue item; the enclosing
    /// contact-level operation still reports success.
    pub fn is_contact_data(&self) -> bool {
        matches!(self, Self::ContactData(_))
    }
}

impl From<tokio_rusqlite::Error> for DispatchError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for DispatchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
