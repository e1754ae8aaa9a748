// src/error.rs

//! Crate-wide error type
//!
//! Stage-specific failures live next to the components that raise them
//! and reach callers as [`ExecutionError`](crate::kitchen::ExecutionError).

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by galley outside of a single stage's own taxonomy
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown template variable: {{{0}}}")]
    MissingVariable(String),

    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),
}
