//! Store error types.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record for key {key}: {detail}")]
    Corrupt { key: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn corrupt(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
