//! Error types for storage operations.

use stowage_filesystem::FileSystemError;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Malformed request (empty bucket or key, bad options).
    #[error("Invalid request: {message}")]
    Validation { message: String },

    /// Part size or payload size cannot be planned.
    #[error("Invalid size: cannot split {total_bytes} bytes into parts of {max_part_size} bytes")]
    InvalidSize { total_bytes: u64, max_part_size: u64 },

    /// Bucket or object not found in the store.
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Local path not found.
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// Local path is neither a regular file nor a directory.
    #[error("Not a regular file or directory: {path}")]
    NotADirectory { path: String },

    /// Access denied.
    #[error("Access denied to s3://{bucket}/{key}: {message}")]
    AccessDenied {
        bucket: String,
        key: String,
        message: String,
    },

    /// Network timeout, throttling or a 5xx-class response.
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Non-transient failure reported by the store (quota, conflict, ...).
    #[error("Service error ({code}): {message}")]
    Service { code: String, message: String },

    /// Local I/O error.
    #[error("I/O error for {path}: {message}")]
    IoError { path: String, message: String },

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Transient,
    Permission,
    Service,
    Io,
    Cancelled,
}

impl StorageError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Validation { .. }
            | StorageError::InvalidSize { .. }
            | StorageError::NotADirectory { .. } => ErrorKind::Validation,
            StorageError::NotFound { .. } | StorageError::PathNotFound { .. } => {
                ErrorKind::NotFound
            }
            StorageError::AccessDenied { .. } => ErrorKind::Permission,
            StorageError::Transient { .. } => ErrorKind::Transient,
            StorageError::Service { .. } => ErrorKind::Service,
            StorageError::IoError { .. } => ErrorKind::Io,
            StorageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        StorageError::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        StorageError::Transient {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

impl From<FileSystemError> for StorageError {
    fn from(err: FileSystemError) -> Self {
        match err {
            FileSystemError::NotFound { path } => StorageError::PathNotFound { path },
            FileSystemError::NotADirectory { path } => StorageError::NotADirectory { path },
            FileSystemError::IoError { path, source } => StorageError::IoError {
                path,
                message: source.to_string(),
            },
            FileSystemError::Path(e) => StorageError::IoError {
                path: String::new(),
                message: e.to_string(),
            },
        }
    }
}

/// Per-key failure recorded during a batch operation.
#[derive(Debug, Clone)]
pub struct KeyFailure {
    /// The key that failed.
    pub key: String,
    /// The error that occurred.
    pub error: StorageError,
}

impl KeyFailure {
    /// Create a new key failure.
    pub fn new(key: impl Into<String>, error: StorageError) -> Self {
        Self {
            key: key.into(),
            error,
        }
    }
}
