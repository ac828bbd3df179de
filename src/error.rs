//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("A rip job is already active: {0}")]
    JobActive(String),

    #[error("No active rip job")]
    NoActiveJob,

    #[error("Disc error: {0}")]
    Disc(String),

    #[error("Rip failed: {0}")]
    Rip(String),

    #[error("Identification error: {0}")]
    Identification(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn disc(msg: impl Into<String>) -> Self {
        Self::Disc(msg.into())
    }

    pub fn rip(msg: impl Into<String>) -> Self {
        Self::Rip(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
