//! Recursive directory enumeration for directory uploads.
//!
//! Files below the root are always keyed by their real path. A symbolic
//! link whose target resolves inside the root is not followed, since the
//! target is walked under its own name anyway. Links leading out of the
//! root are followed, and the walker remembers the canonical identity of
//! every directory and file it has produced: a directory reached a second
//! time is pruned and a file reached a second time is skipped, so a walk
//! always terminates and yields each real file once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stowage_common::{relative_key, to_posix_path};
use walkdir::{DirEntry, FilterEntry, WalkDir};

use crate::error::FileSystemError;

/// A file discovered by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// POSIX-style key relative to the walk root.
    pub relative_key: String,
    /// Local path of the file (below the root, not canonicalized).
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size: u64,
}

/// Recursive, cycle-safe enumerator of a local directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryWalker {
    root: PathBuf,
}

impl DirectoryWalker {
    /// Create a walker for `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root this walker enumerates.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh walk.
    ///
    /// Each call re-reads the file system, so walking again yields a new
    /// snapshot. A regular file root yields one entry keyed by its own name.
    ///
    /// # Errors
    /// * `NotFound` if the root does not exist
    /// * `NotADirectory` if the root is neither a regular file nor a directory
    pub fn walk(&self) -> Result<DirectoryWalk, FileSystemError> {
        let metadata: std::fs::Metadata = match std::fs::metadata(&self.root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileSystemError::NotFound {
                    path: self.root.display().to_string(),
                });
            }
            Err(e) => return Err(FileSystemError::io(self.root.display().to_string(), e)),
        };

        if metadata.is_file() {
            let name: String = self
                .root
                .file_name()
                .map(|n| to_posix_path(Path::new(n)))
                .ok_or_else(|| FileSystemError::NotADirectory {
                    path: self.root.display().to_string(),
                })?;
            return Ok(DirectoryWalk {
                state: WalkState::Single(Some(WalkEntry {
                    relative_key: name,
                    path: self.root.clone(),
                    size: metadata.len(),
                })),
            });
        }

        if !metadata.is_dir() {
            return Err(FileSystemError::NotADirectory {
                path: self.root.display().to_string(),
            });
        }

        let real_root: PathBuf = std::fs::canonicalize(&self.root)
            .map_err(|e| FileSystemError::io(self.root.display().to_string(), e))?;
        let mut visited_dirs: HashSet<PathBuf> = HashSet::new();
        let prune: DirFilter = Box::new(move |entry: &DirEntry| {
            let is_link: bool = entry.depth() > 0 && entry.path_is_symlink();
            if !is_link && !entry.file_type().is_dir() {
                return true;
            }
            // Dangling links fall through and are reported by the iterator.
            let real: PathBuf = match std::fs::canonicalize(entry.path()) {
                Ok(real) => real,
                Err(_) => return true,
            };
            if is_link && real.starts_with(&real_root) {
                log::debug!(
                    "Not following {}, its target {} is inside the walked tree",
                    entry.path().display(),
                    real.display()
                );
                return false;
            }
            if !entry.file_type().is_dir() {
                return true;
            }

            let first_visit: bool = visited_dirs.insert(real);
            if !first_visit {
                log::warn!(
                    "Skipping already visited directory {}",
                    entry.path().display()
                );
            }
            first_visit
        });

        let iter = WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(prune);

        Ok(DirectoryWalk {
            state: WalkState::Tree {
                root: self.root.clone(),
                iter,
                seen_files: HashSet::new(),
            },
        })
    }
}

type DirFilter = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Lazy sequence of files produced by [`DirectoryWalker::walk`].
pub struct DirectoryWalk {
    state: WalkState,
}

enum WalkState {
    Single(Option<WalkEntry>),
    Tree {
        root: PathBuf,
        iter: FilterEntry<walkdir::IntoIter, DirFilter>,
        seen_files: HashSet<PathBuf>,
    },
}

impl std::fmt::Debug for DirectoryWalk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            WalkState::Single(entry) => f.debug_tuple("DirectoryWalk::Single").field(entry).finish(),
            WalkState::Tree { root, .. } => f.debug_tuple("DirectoryWalk::Tree").field(root).finish(),
        }
    }
}

impl Iterator for DirectoryWalk {
    type Item = Result<WalkEntry, FileSystemError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (root, iter, seen_files) = match &mut self.state {
            WalkState::Single(entry) => return entry.take().map(Ok),
            WalkState::Tree {
                root,
                iter,
                seen_files,
            } => (root, iter, seen_files),
        };

        loop {
            let entry: DirEntry = match iter.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(ancestor) = e.loop_ancestor() {
                        log::warn!("Skipping symlink loop back to {}", ancestor.display());
                        continue;
                    }
                    let path: String = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    let io_error: Option<&std::io::Error> = e.io_error();
                    if io_error.map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) {
                        log::warn!("Skipping dangling symlink {}", path);
                        continue;
                    }
                    return Some(Err(FileSystemError::io(path, e.into())));
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path: &Path = entry.path();
            match std::fs::canonicalize(path) {
                Ok(real) => {
                    if !seen_files.insert(real) {
                        log::warn!("Skipping already visited file {}", path.display());
                        continue;
                    }
                }
                Err(e) => return Some(Err(FileSystemError::io(path.display().to_string(), e))),
            }

            let size: u64 = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    return Some(Err(FileSystemError::io(
                        path.display().to_string(),
                        e.into(),
                    )))
                }
            };

            let key: String = match relative_key(path, root) {
                Ok(k) => k,
                Err(e) => return Some(Err(e.into())),
            };

            return Some(Ok(WalkEntry {
                relative_key: key,
                path: path.to_path_buf(),
                size,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_files(root: &Path) {
        std::fs::create_dir_all(root.join("subdir/deeper")).unwrap();
        std::fs::write(root.join("file1.txt"), b"one").unwrap();
        std::fs::write(root.join("subdir/nested.txt"), b"nested").unwrap();
        std::fs::write(root.join("subdir/deeper/leaf.bin"), b"leaf-bytes").unwrap();
    }

    fn keys(walker: &DirectoryWalker) -> Vec<String> {
        walker
            .walk()
            .unwrap()
            .map(|e| e.unwrap().relative_key)
            .collect()
    }

    #[test]
    fn test_walk_nested_tree() {
        let dir: TempDir = TempDir::new().unwrap();
        create_test_files(dir.path());

        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());
        let entries: Vec<WalkEntry> = walker.walk().unwrap().map(|e| e.unwrap()).collect();

        let keys: Vec<&str> = entries.iter().map(|e| e.relative_key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["file1.txt", "subdir/deeper/leaf.bin", "subdir/nested.txt"]
        );
        let leaf: &WalkEntry = entries.iter().find(|e| e.relative_key.ends_with("leaf.bin")).unwrap();
        assert_eq!(leaf.size, 10);
    }

    #[test]
    fn test_walk_is_restartable() {
        let dir: TempDir = TempDir::new().unwrap();
        create_test_files(dir.path());
        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());

        let first: Vec<String> = keys(&walker);
        std::fs::write(dir.path().join("added.txt"), b"new").unwrap();
        let second: Vec<String> = keys(&walker);

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 4);
        assert!(second.contains(&"added.txt".to_string()));
    }

    #[test]
    fn test_walk_skips_empty_directories() {
        let dir: TempDir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();

        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());
        assert!(keys(&walker).is_empty());
    }

    #[test]
    fn test_walk_single_file_root() {
        let dir: TempDir = TempDir::new().unwrap();
        let file: PathBuf = dir.path().join("report.pdf");
        std::fs::write(&file, b"%PDF").unwrap();

        let walker: DirectoryWalker = DirectoryWalker::new(&file);
        let entries: Vec<WalkEntry> = walker.walk().unwrap().map(|e| e.unwrap()).collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_key, "report.pdf");
        assert_eq!(entries[0].path, file);
        assert_eq!(entries[0].size, 4);
    }

    #[test]
    fn test_walk_missing_root() {
        let dir: TempDir = TempDir::new().unwrap();
        let walker: DirectoryWalker = DirectoryWalker::new(dir.path().join("nope"));
        assert!(matches!(walker.walk(), Err(FileSystemError::NotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_rejects_special_file_root() {
        let walker: DirectoryWalker = DirectoryWalker::new("/dev/null");
        assert!(matches!(
            walker.walk(),
            Err(FileSystemError::NotADirectory { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_terminates_on_symlink_cycle() {
        let dir: TempDir = TempDir::new().unwrap();
        create_test_files(dir.path());
        // subdir/deeper/back -> root, subdir/loop -> subdir
        std::os::unix::fs::symlink(dir.path(), dir.path().join("subdir/deeper/back")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("subdir"), dir.path().join("subdir/loop"))
            .unwrap();

        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());
        let mut found: Vec<String> = keys(&walker);
        found.sort();

        assert_eq!(
            found,
            vec!["file1.txt", "subdir/deeper/leaf.bin", "subdir/nested.txt"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_keys_aliased_directory_by_real_name() {
        let dir: TempDir = TempDir::new().unwrap();
        create_test_files(dir.path());
        // "alias" sorts before "subdir" but must not take its keys.
        std::os::unix::fs::symlink(dir.path().join("subdir"), dir.path().join("alias")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("file1.txt"), dir.path().join("a-link.txt"))
            .unwrap();

        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());

        assert_eq!(
            keys(&walker),
            vec!["file1.txt", "subdir/deeper/leaf.bin", "subdir/nested.txt"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_follows_links_leaving_the_root_once() {
        let outside: TempDir = TempDir::new().unwrap();
        std::fs::write(outside.path().join("shared.txt"), b"shared").unwrap();
        let dir: TempDir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("own.txt"), b"own").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("ext")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("ext-again")).unwrap();

        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());

        assert_eq!(keys(&walker), vec!["ext/shared.txt", "own.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_skips_dangling_symlink() {
        let dir: TempDir = TempDir::new().unwrap();
        create_test_files(dir.path());
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("dangling"))
            .unwrap();

        let walker: DirectoryWalker = DirectoryWalker::new(dir.path());
        assert_eq!(keys(&walker).len(), 3);
    }
}
