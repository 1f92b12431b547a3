//! Persistence layer error types

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Database connection error
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored column could not be mapped back to its domain type
    #[error("Corrupt {column} value: {reason}")]
    Decode { column: String, reason: String },

    /// Database error from SQLx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn decode(column: &str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            column: column.to_string(),
            reason: reason.to_string(),
        }
    }
}
