use thiserror::Error;

#[derive(Debug, Error)]
pub enum SalesBridgeError {
    #[error("Config error: {0}")]
    Config(String),

    /// The sales database could not be opened or introspected.
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SalesBridgeError>;
