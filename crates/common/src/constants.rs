//! Shared constants used across stowage crates.

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Default maximum part size for multipart uploads (8 MiB).
/// Objects at or below this size are uploaded with a single put.
pub const DEFAULT_MAX_PART_SIZE: u64 = 8 * MIB;

/// Maximum number of parts a multipart upload may have.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Maximum number of keys accepted by a single bulk delete request.
pub const DELETE_BATCH_LIMIT: usize = 1000;

/// Default page size requested from list operations.
pub const DEFAULT_LIST_PAGE_SIZE: i32 = 1000;

/// Default number of retries after the first attempt of a part upload.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Prefix for staged temporary files.
pub const STAGING_FILE_PREFIX: &str = "stowage-";

/// Suffix for staged temporary files.
pub const STAGING_FILE_SUFFIX: &str = ".s3object";
