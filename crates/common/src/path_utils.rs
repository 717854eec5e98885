//! Path and object key normalization utilities.
//!
//! Object keys are always POSIX style, never start with the separator, and
//! directory markers are keys ending with `/`.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Separator used inside object keys.
pub const KEY_SEPARATOR: char = '/';

/// Convert a path to absolute without resolving symlinks.
///
/// # Arguments
/// * `path` - Path to convert (relative or absolute)
///
/// # Returns
/// Absolute path, joining with current directory if relative.
///
/// # Errors
/// Returns error if current directory cannot be determined.
pub fn to_absolute(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        std::env::current_dir()
            .map(|cwd: PathBuf| cwd.join(path))
            .map_err(|e: std::io::Error| PathError::IoError {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

/// Lexical path normalization without filesystem access.
///
/// Removes `.` components and resolves `..` components lexically.
/// Does not access the filesystem or resolve symlinks.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !components.is_empty()
                    && !matches!(
                        components.last(),
                        Some(Component::ParentDir) | Some(Component::RootDir)
                    )
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }

    components.iter().collect()
}

/// Compute the object key fragment for a file below a local root.
///
/// The path is made absolute without resolving symlinks, normalized
/// lexically and returned relative to `root` in POSIX form.
///
/// # Arguments
/// * `path` - Path of the file
/// * `root` - Local root directory
///
/// # Errors
/// Returns error if path is outside the root directory or equals it.
pub fn relative_key(path: &Path, root: &Path) -> Result<String, PathError> {
    let abs_path: PathBuf = to_absolute(path)?;
    let normalized: PathBuf = lexical_normalize(&abs_path);

    let abs_root: PathBuf = to_absolute(root)?;
    let normalized_root: PathBuf = lexical_normalize(&abs_root);

    let relative: &Path = normalized
        .strip_prefix(&normalized_root)
        .map_err(|_| PathError::PathOutsideRoot {
            path: normalized.display().to_string(),
            root: normalized_root.display().to_string(),
        })?;

    let key: String = to_posix_path(relative);
    if key.is_empty() {
        return Err(PathError::InvalidPath {
            path: normalized.display().to_string(),
        });
    }
    Ok(key)
}

/// Convert a path to POSIX-style string (forward slashes).
pub fn to_posix_path(path: &Path) -> String {
    path.components()
        .map(|c: Component| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a virtual directory prefix and a relative key.
///
/// Leading and trailing separators of the prefix are dropped, so
/// `("photos/", "a.jpg")` and `("/photos", "a.jpg")` both give `photos/a.jpg`.
/// An empty prefix yields the relative key unchanged.
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix: &str = prefix.trim_matches(KEY_SEPARATOR);
    let relative: &str = relative.trim_start_matches(KEY_SEPARATOR);
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}{}{}", prefix, KEY_SEPARATOR, relative)
    }
}

/// Key of the zero-length marker object representing a virtual directory.
pub fn directory_marker_key(name: &str) -> String {
    let trimmed: &str = name.trim_matches(KEY_SEPARATOR);
    format!("{}{}", trimmed, KEY_SEPARATOR)
}

/// Check that `key` is a usable object key.
///
/// # Errors
/// Returns `InvalidPath` if the key is empty or starts with the separator.
pub fn validate_object_key(key: &str) -> Result<(), PathError> {
    if key.is_empty() || key.starts_with(KEY_SEPARATOR) {
        return Err(PathError::InvalidPath {
            path: key.to_string(),
        });
    }
    Ok(())
}
