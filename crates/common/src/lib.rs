//! Shared types and utilities for stowage.
//!
//! This crate provides common functionality used across all stowage crates:
//! - Object key and path normalization utilities
//! - Shared constants (part sizes, batch limits, staging names)
//! - Shared error types

pub mod constants;
pub mod error;
pub mod path_utils;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::PathError;
pub use path_utils::{
    directory_marker_key, join_key, lexical_normalize, relative_key,
    to_absolute, to_posix_path, validate_object_key, KEY_SEPARATOR,
};
