//! Error types for the balena broker

use std::io;

use thiserror::Error;

/// Result type alias for the balena broker
pub type Result<T> = std::result::Result<T, Error>;

/// Broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid backend configuration (no URL, no master credential)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Role (or other named record) absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input, rejected before any write
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport or decode failure talking to the balena API
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Lease private data is missing an expected field or has the wrong type
    #[error("Malformed lease: {0}")]
    MalformedLease(String),

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind, used as the `error` field of HTTP bodies
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Upstream(_) | Self::Http(_) => "upstream_error",
            Self::MalformedLease(_) => "malformed_lease",
            Self::Storage(_) | Self::Io(_) => "storage_error",
            Self::Json(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the failure was caused by the caller's input rather than the broker
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Validation(_) | Self::MalformedLease(_)
        )
    }
}
