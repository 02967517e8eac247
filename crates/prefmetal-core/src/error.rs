//! Error types for prefmetal.

use thiserror::Error;

/// Result type alias for prefmetal operations.
pub type Result<T> = std::result::Result<T, PrefMetalError>;

/// Main error type for prefmetal operations.
#[derive(Error, Debug)]
pub enum PrefMetalError {
    /// Model loading errors.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed dataset record.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Conversation template errors, including role alternation violations.
    #[error("Template error: {0}")]
    Template(String),

    /// Training errors.
    #[error("Training error: {0}")]
    Training(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// MLX backend errors.
    #[error("MLX error: {0}")]
    Mlx(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not implemented.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl From<serde_json::Error> for PrefMetalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
