//! Error types for site2docs.
//!
//! Library crates use [`Site2DocsError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::Stage;

/// Top-level error type for all site2docs operations.
#[derive(Debug, thiserror::Error)]
pub enum Site2DocsError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The input directory is missing or unusable. Raised before any stage starts.
    #[error("input error: {message}")]
    Input { message: String },

    /// A snapshot could not be rendered and fallback to raw markup is disabled.
    #[error("render failed for {path:?} after {attempts} attempt(s): {reason}")]
    Render {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// Browser launch or session error outside a single page render.
    #[error("browser error: {0}")]
    Browser(String),

    /// Content extraction error for a single page.
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// The cluster set does not partition the page set.
    #[error("cluster validation failed: {missing:?}")]
    ClusterValidation {
        /// Cluster id → offending page ids.
        missing: BTreeMap<String, Vec<String>>,
    },

    /// Stage ledger ordering violation or sink failure.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A run aborted after the stage ledger opened.
    #[error(
        "{failed_stage} stage failed (last completed stage: {}, last file: {}): {cause}",
        .last_completed_stage.map_or("none", Stage::as_str),
        .last_file.as_deref().unwrap_or("none")
    )]
    Fatal {
        failed_stage: Stage,
        last_completed_stage: Option<Stage>,
        last_file: Option<String>,
        cause: Box<Site2DocsError>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, Site2DocsError>;

impl Site2DocsError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an input error from any displayable message.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input {
            message: msg.into(),
        }
    }

    /// Create an extraction error from any displayable message.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
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

    /// The snapshot path this error is about, when there is one.
    pub fn offending_file(&self) -> Option<&std::path::Path> {
        match self {
            Self::Render { path, .. } | Self::Io { path, .. } => Some(path.as_path()),
            Self::Fatal { cause, .. } => cause.offending_file(),
            _ => None,
        }
    }
}
