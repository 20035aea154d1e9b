//! Error types for baichuan-core.

use thiserror::Error;

/// Top-level error type for model construction, caching and generation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model load error: {0}")]
    ModelLoadError(String),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("KV cache error: {0}")]
    CacheError(String),

    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    #[error("Communication error: {0}")]
    CommError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
