//! Error types for Learnline.
//!
//! Library crates use [`LearnlineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Learnline operations.
#[derive(Debug, thiserror::Error)]
pub enum LearnlineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external service or fetching a page.
    #[error("network error: {0}")]
    Network(String),

    /// An external service answered, but with a failure or a malformed payload.
    #[error("{service} error: {message}")]
    Upstream { service: String, message: String },

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A versioned record was modified by another writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input rejected at a boundary.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Every discovery call of a strategy round failed.
    #[error("content discovery unavailable: {0}")]
    DiscoveryUnavailable(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LearnlineError>;

impl LearnlineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an upstream error attributed to a named service.
    pub fn upstream(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Upstream {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Upstream { .. })
    }
}
