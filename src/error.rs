//! Error types for the signal-to-position pipeline

use thiserror::Error;

use crate::risk::RiskRejection;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the pipeline
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid token address on {chain}: {address}")]
    InvalidToken { chain: String, address: String },

    // Signal source errors
    #[error("Source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("Source connection failed: {0}")]
    SourceConnection(String),

    // Validation errors
    #[error("Safety oracle {service} failed: {reason}")]
    Oracle { service: String, reason: String },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    // Market data errors
    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // Risk errors
    #[error("Risk rejected: {0}")]
    RiskRejected(RiskRejection),

    // Execution errors
    #[error("Submission failed (transient): {0}")]
    SubmissionTransient(String),

    #[error("Submission failed: {0}")]
    SubmissionFatal(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // Position errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position already open for {0}")]
    DuplicatePosition(String),

    #[error("Invalid position transition for {position_id}: {from} -> {to}")]
    InvalidTransition {
        position_id: String,
        from: String,
        to: String,
    },

    // Ledger errors
    #[error("Ledger invariant violated: {0}")]
    LedgerInvariant(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. }
                | Error::SourceConnection(_)
                | Error::Timeout(_)
                | Error::Http(_)
                | Error::PriceUnavailable(_)
                | Error::SubmissionTransient(_)
        )
    }

    /// Check if this error is a safety violation
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            Error::RiskRejected(_) | Error::DuplicatePosition(_) | Error::LedgerInvariant(_)
        )
    }
}

impl From<RiskRejection> for Error {
    fn from(rejection: RiskRejection) -> Self {
        Error::RiskRejected(rejection)
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(0)
        } else if e.is_decode() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
