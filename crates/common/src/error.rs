use thiserror::Error;

use crate::RejectionReason;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Insufficient data for {indicator}: need {required} bars, have {available}")]
    InsufficientData {
        indicator: &'static str,
        required: usize,
        available: usize,
    },

    #[error("Invalid bar sequence: {0}")]
    InvalidBars(String),

    #[error("Risk rejection: {0}")]
    RiskRejected(RejectionReason),

    /// Network failure, timeout or rate limit. Safe to retry.
    #[error("Transient exchange error: {0}")]
    ExchangeTransient(String),

    /// The venue refused the request. Never retried.
    #[error("Exchange rejected request: {0}")]
    ExchangeRejection(String),

    #[error("State inconsistency: {0}")]
    StateInconsistency(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Persisted state is corrupt: {0}")]
    CorruptState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Conditions that must stop the trading loop instead of skipping a tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::CorruptState(_) | Error::Database(_)
        )
    }

    /// Errors the retry policy may try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ExchangeTransient(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
