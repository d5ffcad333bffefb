// Collection DB Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database schema version {found} is newer than this build supports (max {supported})")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Scanner error: {0}")]
    Scanner(String),

    #[error("Scanner output could not be decoded: {0}")]
    StreamDecode(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Scanning unavailable: {0}")]
    Busy(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CollectionError {
    fn from(err: anyhow::Error) -> Self {
        CollectionError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollectionError>;
