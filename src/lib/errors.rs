//! Error types for duplicate marking.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for duplicate-marking operations.
pub type Result<T> = std::result::Result<T, MarkDupError>;

/// Error type for duplicate-marking operations.
///
/// Every variant is fatal to the run: the driver prints one diagnostic
/// line, the temp-file registry unlinks its files on unwind, and the
/// process exits nonzero.
#[derive(Error, Debug)]
pub enum MarkDupError {
    /// The input stream is not a well-formed BGZF/BAM file.
    #[error("malformed input: {reason}")]
    MalformedInput {
        /// Explanation of the framing or record problem.
        reason: String,
    },

    /// Read/write/seek failure on the input, output, or a temp file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or contradictory configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Explanation of the rejected setting.
        reason: String,
    },

    /// A temporary file could not be created.
    #[error("cannot create temporary file '{}': {source}", path.display())]
    Resource {
        /// The path that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl MarkDupError {
    /// Shorthand for a [`MarkDupError::MalformedInput`].
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput { reason: reason.into() }
    }

    /// Shorthand for a [`MarkDupError::Config`].
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }
}
