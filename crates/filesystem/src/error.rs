//! Error types for file system operations.

use stowage_common::PathError;
use thiserror::Error;

/// Errors that can occur while walking or staging local files.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// The requested root does not exist.
    #[error("Path not found: {path}")]
    NotFound {
        /// The missing path.
        path: String,
    },

    /// The root exists but is neither a regular file nor a directory.
    #[error("Not a regular file or directory: {path}")]
    NotADirectory {
        /// The offending path.
        path: String,
    },

    /// I/O error at a specific path.
    #[error("I/O error at {path}: {source}")]
    IoError {
        /// Path where the error occurred.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Path normalization failed.
    #[error(transparent)]
    Path(#[from] PathError),
}

impl FileSystemError {
    /// Create an IoError for a path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }
}
