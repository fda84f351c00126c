//! Error types for cg-core

use thiserror::Error;

/// Main error type shared by the CampusGo client crates
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session expired, please log in again")]
    SessionExpired,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller should send the user back to a login flow
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

/// Result type alias for the CampusGo client crates
pub type Result<T> = std::result::Result<T, Error>;
