//! Shared error types used across stowage crates.

use thiserror::Error;

/// Path-related errors shared across crates.
#[derive(Debug, Error, Clone)]
pub enum PathError {
    /// Path is outside the expected root directory.
    #[error("Path is outside root: {path} not in {root}")]
    PathOutsideRoot {
        /// The path that was checked.
        path: String,
        /// The root directory it should be within.
        root: String,
    },

    /// Path is invalid or malformed.
    #[error("Invalid path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: String,
    },

    /// IO error occurred while accessing path.
    #[error("IO error at {path}: {message}")]
    IoError {
        /// Path where error occurred.
        path: String,
        /// Error message.
        message: String,
    },
}
