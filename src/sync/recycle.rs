//! Replica-local recycle area.
//!
//! Content that would otherwise be destroyed (overwritten, deleted or losing a
//! conflict) is moved to `<root>/.twinsync/recycle/<item_id>/<timestamp>-<name>`
//! before the destructive operation runs.

use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};

use crate::fs::ReplicaFs;
use crate::sync::metadata::ItemId;
use crate::sync::path_utils::STATE_DIR;

const RECYCLE_DIR: &str = "recycle";

#[derive(Debug, Clone)]
pub struct RecycleBin {
    dir: PathBuf,
}

impl RecycleBin {
    pub fn new(replica_root: &Path) -> Self {
        Self {
            dir: replica_root.join(STATE_DIR).join(RECYCLE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Folder holding every preserved version of `item_id`.
    pub fn item_dir(&self, item_id: &ItemId) -> PathBuf {
        self.dir.join(item_id.to_string())
    }

    /// Move `file` into the recycle area.
    ///
    /// Returns `Ok(None)` when there is nothing to preserve because the file
    /// is already gone.
    pub fn preserve(&self, fs: &dyn ReplicaFs, file: &Path, item_id: &ItemId) -> io::Result<Option<PathBuf>> {
        match fs.metadata(file) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ");
        let target = self.item_dir(item_id).join(format!("{}-{}", stamp, name));

        fs.create_dir(&self.item_dir(item_id))?;
        if let Err(e) = fs.rename(file, &target) {
            // Different device or similar; fall back to copy then remove
            tracing::debug!("Rename into recycle area failed ({}), copying {}", e, file.display());
            fs.copy_file(file, &target)?;
            fs.remove_file(file)?;
        }

        tracing::debug!("Recycled {} to {}", file.display(), target.display());
        Ok(Some(target))
    }

    /// All preserved versions of `item_id`, oldest first.
    pub fn versions(&self, item_id: &ItemId) -> io::Result<Vec<PathBuf>> {
        let dir = self.item_dir(item_id);
        let mut versions = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        versions.sort();
        Ok(versions)
    }
}
