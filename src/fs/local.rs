use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use crate::fs::backend::ReplicaFs;
use crate::sync::path_utils::STAGING_SUFFIX;

/// Local disk implementation of [`ReplicaFs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }

    fn ensure_parent(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Sibling temp path used while copying, hidden and process-unique.
    fn staging_path(to: &Path) -> PathBuf {
        let name = to
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        to.with_file_name(format!(".{}.{}{}", name, std::process::id(), STAGING_SUFFIX))
    }
}

impl ReplicaFs for LocalFs {
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        Self::ensure_parent(to)?;

        // Copy next to the target, then rename over it
        let staging = Self::staging_path(to);
        let written = match fs::copy(from, &staging) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&staging, to) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        Ok(written)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        Self::ensure_parent(to)?;
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::symlink_metadata(path)
    }

    fn is_empty_dir(&self, path: &Path) -> io::Result<bool> {
        Ok(fs::read_dir(path)?.next().is_none())
    }
}
