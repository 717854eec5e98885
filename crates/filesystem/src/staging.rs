//! Temporary staging of single-pass byte streams.
//!
//! Network bodies and other readers can only be consumed once. Multipart
//! uploads and retries need to re-read arbitrary byte ranges, so the stream
//! is first copied into a uniquely named file below a private staging root.
//!
//! A `StagedFile` removes its file when released or dropped, so every exit
//! path (success, error, cancellation) cleans up. `Stager::purge` removes
//! anything left behind, and dropping the `Stager` removes its root.

use std::path::{Path, PathBuf};

use stowage_common::{STAGING_FILE_PREFIX, STAGING_FILE_SUFFIX};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::FileSystemError;

/// Owner of a private staging directory.
#[derive(Debug)]
pub struct Stager {
    root: TempDir,
}

impl Stager {
    /// Create a staging root inside the system temporary directory.
    pub fn new() -> Result<Self, FileSystemError> {
        let root: TempDir = tempfile::Builder::new()
            .prefix("stowage-staging-")
            .tempdir()
            .map_err(|e| FileSystemError::io(std::env::temp_dir().display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Create a staging root inside `parent`, creating `parent` if needed.
    ///
    /// # Arguments
    /// * `parent` - Directory that will contain the private staging root
    pub fn in_dir(parent: &Path) -> Result<Self, FileSystemError> {
        std::fs::create_dir_all(parent)
            .map_err(|e| FileSystemError::io(parent.display().to_string(), e))?;
        let root: TempDir = tempfile::Builder::new()
            .prefix("stowage-staging-")
            .tempdir_in(parent)
            .map_err(|e| FileSystemError::io(parent.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Path of the staging root.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Copy `reader` to a new staged file.
    ///
    /// # Arguments
    /// * `reader` - Source stream, read to end
    ///
    /// # Errors
    /// Returns `IoError` if the file cannot be created or written, or if the
    /// reader fails mid-copy. The partial file is removed in both cases.
    pub async fn stage<R>(&self, reader: &mut R) -> Result<StagedFile, FileSystemError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let named = tempfile::Builder::new()
            .prefix(STAGING_FILE_PREFIX)
            .suffix(STAGING_FILE_SUFFIX)
            .tempfile_in(self.root.path())
            .map_err(|e| FileSystemError::io(self.root.path().display().to_string(), e))?;

        let (std_file, path): (std::fs::File, PathBuf) = named
            .keep()
            .map_err(|e| FileSystemError::io(self.root.path().display().to_string(), e.error))?;

        // From here on the guard owns the file.
        let mut staged = StagedFile {
            path,
            size: 0,
            released: false,
        };

        let mut file = tokio::fs::File::from_std(std_file);
        let size: u64 = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| FileSystemError::io(staged.path.display().to_string(), e))?;
        file.flush()
            .await
            .map_err(|e| FileSystemError::io(staged.path.display().to_string(), e))?;

        staged.size = size;
        log::debug!("Staged {} bytes at {}", size, staged.path.display());
        Ok(staged)
    }

    /// Remove every file still present in the staging root.
    ///
    /// The root itself stays in place until the `Stager` is dropped.
    ///
    /// # Returns
    /// Number of leftover files removed.
    pub fn purge(&self) -> Result<usize, FileSystemError> {
        let root: &Path = self.root.path();
        let entries = std::fs::read_dir(root)
            .map_err(|e| FileSystemError::io(root.display().to_string(), e))?;

        let mut removed: usize = 0;
        for entry in entries {
            let entry = entry.map_err(|e| FileSystemError::io(root.display().to_string(), e))?;
            let path: PathBuf = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)
                    .map_err(|e| FileSystemError::io(path.display().to_string(), e))?;
            } else {
                release_path(&path)?;
            }
            removed += 1;
        }
        if removed > 0 {
            log::debug!("Purged {} staged files from {}", removed, root.display());
        }
        Ok(removed)
    }
}

/// A staged temporary file, removed on release or drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    size: u64,
    released: bool,
}

impl StagedFile {
    /// Path of the staged file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes staged.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the staged file.
    ///
    /// Calling this more than once, or after the file was removed by other
    /// means, is a no-op.
    pub fn release(&mut self) -> Result<(), FileSystemError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        release_path(&self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to remove staged file {}: {}", self.path.display(), e);
        }
    }
}

/// Remove a staged path, treating an already-missing file as success.
pub fn release_path(path: &Path) -> Result<(), FileSystemError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FileSystemError::io(path.display().to_string(), e)),
    }
}
