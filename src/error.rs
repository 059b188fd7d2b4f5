// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for circuit-lens.

/// Errors that can occur during MI operations.
#[derive(Debug, thiserror::Error)]
pub enum MIError {
    /// Model runtime or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Ablation mask validation or application error.
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Steering vector construction, decoding, or application error.
    #[error("steering error: {0}")]
    Steering(String),

    /// Model or analysis configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenization error reported by the model runtime.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed base64 payload for a persisted steering vector.
    #[error("encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for circuit-lens operations.
pub type Result<T> = std::result::Result<T, MIError>;
