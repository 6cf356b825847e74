//! Error types for the protection engine
//!
//! None of these abort the evaluation loop. Callers log them and fall back
//! to the permissive default (NORMAL regime, empty penalty ledger).

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("sample at {sample} is older than newest sample at {newest}")]
    OutOfOrderSample {
        sample: DateTime<Utc>,
        newest: DateTime<Utc>,
    },

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("unknown position: {0}")]
    UnknownPosition(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for GuardError {
    fn from(err: reqwest::Error) -> Self {
        Self::Notification(err.to_string())
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
