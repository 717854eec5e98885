//! Error types for AWS SDK storage operations.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use stowage_storage::StorageError;
use thiserror::Error;

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NoSuchUpload", "NotFound"];
const ACCESS_DENIED_CODES: &[&str] = &["AccessDenied", "AllAccessDisabled", "InvalidAccessKeyId"];
const THROTTLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

/// Errors specific to the AWS SDK storage client.
#[derive(Error, Debug)]
pub enum CrtError {
    /// The request did not complete in time.
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    /// The request never reached the service (DNS, connect, TLS).
    #[error("Dispatch failure: {message}")]
    Dispatch { message: String },

    /// The request could not be built.
    #[error("Invalid request: {message}")]
    Construction { message: String },

    /// The service answered with an error.
    #[error("S3 error {code} (HTTP {status}): {message}")]
    Service {
        code: String,
        /// HTTP status, 0 when unknown.
        status: u16,
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error writing a download.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CrtError {
    /// Classify an SDK error by its failure mode, error code and HTTP status.
    pub fn from_sdk<E>(err: SdkError<E, HttpResponse>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        let status: u16 = err
            .raw_response()
            .map(|response| response.status().as_u16())
            .unwrap_or(0);
        let context: String = DisplayErrorContext(&err).to_string();

        match &err {
            SdkError::ConstructionFailure(_) => CrtError::Construction { message: context },
            SdkError::TimeoutError(_) => CrtError::Timeout { message: context },
            SdkError::DispatchFailure(_) => CrtError::Dispatch { message: context },
            _ => {
                let code: String = match err.code() {
                    Some(code) => code.to_string(),
                    None if status == 404 => "NotFound".to_string(),
                    None => "Unknown".to_string(),
                };
                let message: String = err.message().map(str::to_string).unwrap_or(context);
                CrtError::Service {
                    code,
                    status,
                    message,
                }
            }
        }
    }

    /// Whether the service reported a missing bucket, key or upload.
    pub fn is_not_found(&self) -> bool {
        match self {
            CrtError::Service { code, status, .. } => {
                *status == 404 || NOT_FOUND_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrtError::Timeout { .. } | CrtError::Dispatch { .. } => true,
            CrtError::Service { code, status, .. } => {
                *status >= 500 || *status == 429 || THROTTLE_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Convert to a `StorageError` about `bucket`/`key`.
    pub fn into_storage(self, bucket: &str, key: &str) -> StorageError {
        if self.is_retryable() {
            return StorageError::transient(self.to_string());
        }
        match self {
            CrtError::Service {
                code,
                status,
                message,
            } => {
                if status == 403 || ACCESS_DENIED_CODES.contains(&code.as_str()) {
                    StorageError::AccessDenied {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        message,
                    }
                } else if status == 404 || NOT_FOUND_CODES.contains(&code.as_str()) {
                    StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::Service { code, message }
                }
            }
            CrtError::Construction { message } | CrtError::ConfigError(message) => {
                StorageError::Validation { message }
            }
            CrtError::IoError { path, source } => StorageError::IoError {
                path,
                message: source.to_string(),
            },
            // Retryable variants returned above.
            other => StorageError::transient(other.to_string()),
        }
    }
}

impl From<BuildError> for CrtError {
    fn from(err: BuildError) -> Self {
        CrtError::Construction {
            message: err.to_string(),
        }
    }
}

impl From<CrtError> for StorageError {
    fn from(err: CrtError) -> Self {
        err.into_storage("", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_storage::ErrorKind;

    fn service(code: &str, status: u16) -> CrtError {
        CrtError::Service {
            code: code.to_string(),
            status,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_throttling_and_server_errors_are_transient() {
        for err in [
            service("SlowDown", 503),
            service("InternalError", 500),
            service("Unknown", 502),
            service("TooManyRequests", 429),
            service("RequestTimeout", 400),
            CrtError::Timeout {
                message: "read".to_string(),
            },
            CrtError::Dispatch {
                message: "connect".to_string(),
            },
        ] {
            assert!(err.is_retryable(), "{}", err);
            assert_eq!(err.into_storage("b", "k").kind(), ErrorKind::Transient);
        }
    }

    #[test]
    fn test_access_denied_mapping() {
        let err = service("AccessDenied", 403).into_storage("b", "k");
        assert!(matches!(
            err,
            StorageError::AccessDenied { ref bucket, ref key, .. } if bucket == "b" && key == "k"
        ));
        assert_eq!(
            service("Forbidden", 403).into_storage("b", "k").kind(),
            ErrorKind::Permission
        );
    }

    #[test]
    fn test_not_found_mapping() {
        for err in [
            service("NoSuchKey", 404),
            service("NoSuchBucket", 404),
            service("NoSuchUpload", 404),
            service("NotFound", 0),
        ] {
            assert!(err.is_not_found());
            assert_eq!(err.into_storage("b", "k").kind(), ErrorKind::NotFound);
        }
    }

    #[test]
    fn test_other_errors_map_to_validation_or_service() {
        assert!(matches!(
            service("InvalidArgument", 400).into_storage("b", "k"),
            StorageError::Service { ref code, .. } if code == "InvalidArgument"
        ));
        assert_eq!(
            CrtError::Construction {
                message: "missing key".to_string()
            }
            .into_storage("b", "k")
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            StorageError::from(CrtError::ConfigError("no region".to_string())).kind(),
            ErrorKind::Validation
        );
    }
}
