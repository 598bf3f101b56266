use rusqlite;
use std::io;
use thiserror::Error;

/// Every failure the roster core can surface.
///
/// The `Display` text of the user-facing variants is shown verbatim to the
/// requester, so it must name the affected character or identity.
#[derive(Error, Debug)]
pub enum RosterError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to parse config: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    /// Bad input from the requester (malformed name, unsupported server).
    #[error("{0}")]
    UserInput(String),
    /// The external source timed out or is unavailable.
    #[error("{0}")]
    TransientSource(String),
    /// The character is not (yet) visible as a guild member.
    #[error("{0}")]
    NotYetDetected(String),
    /// Duplicate registration or queue ownership conflict.
    #[error("{0}")]
    ConsistencyViolation(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Expired(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl RosterError {
    /// Whether the retry queue should keep the attempt pending after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RosterError::TransientSource(_) | RosterError::NotYetDetected(_)
        )
    }
}
