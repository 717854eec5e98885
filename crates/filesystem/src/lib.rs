//! Local file system operations for stowage.
//!
//! This crate provides the local side of transfers:
//! - `DirectoryWalker` - Cycle-safe recursive enumeration of a directory into object keys
//! - `Stager` / `StagedFile` - Materializing single-pass streams into temporary files

pub mod error;
pub mod staging;
pub mod walker;

// Re-export main types
pub use error::FileSystemError;
pub use staging::{release_path, StagedFile, Stager};
pub use walker::{DirectoryWalk, DirectoryWalker, WalkEntry};
