//! Error types shared across engine components

use thiserror::Error;

/// Engine-level errors. Per-file failures (unparseable or unreadable
/// sources) are handled by skipping the file and never surface here;
/// these variants cover whole-request failures and component validation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("watch error on {path}: {message}")]
    Watch { path: String, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("repository root not found: {0}")]
    MissingRoot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
