use std::fs::Metadata;
use std::io;
use std::path::Path;

/// Filesystem operations the sync engine performs on a replica.
///
/// Every destination mutation goes through this trait so that callers can
/// observe or fail individual operations. Paths are absolute.
pub trait ReplicaFs: Send + Sync {
    /// Copy a regular file, creating parent directories as needed.
    /// The destination is replaced atomically. Returns bytes written.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Move a file or directory, creating the target's parent directories.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a regular file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Create a directory and any missing parents.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Metadata without following symlinks.
    fn metadata(&self, path: &Path) -> io::Result<Metadata>;

    /// Whether a directory has no entries.
    fn is_empty_dir(&self, path: &Path) -> io::Result<bool>;

    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }
}
