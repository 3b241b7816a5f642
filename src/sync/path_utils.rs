// Path helpers for replica-relative paths
// Relative paths are stored with forward slashes on every platform

use std::path::{Component, Path, PathBuf};

/// Name of the reserved per-replica state directory.
pub const STATE_DIR: &str = ".twinsync";

/// Suffix of the temporary files written while a copy is in flight.
pub const STAGING_SUFFIX: &str = ".twinsync-tmp";

/// Convert an absolute path under `root` into a `/`-separated relative path.
/// Returns None when the path is not below the root, is the root itself, or
/// has a component that is not valid UTF-8.
pub fn relative_string(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();

    for component in relative.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?.to_string()),
            Component::CurDir => continue,
            _ => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Resolve a stored relative path against a replica root.
pub fn to_native(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in relative.split(['/', '\\']).filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Number of components in a relative path.
pub fn depth(relative: &str) -> usize {
    relative.split('/').filter(|p| !p.is_empty()).count()
}

/// True when the path lives inside the reserved state directory.
pub fn is_reserved(relative: &str) -> bool {
    relative == STATE_DIR || relative.starts_with(&format!("{}/", STATE_DIR))
}

/// True for in-flight copy files, which are never synchronized.
pub fn is_staging(relative: &str) -> bool {
    relative.ends_with(STAGING_SUFFIX)
}

/// True when `relative` equals `prefix` or is nested below it.
pub fn is_within(relative: &str, prefix: &str) -> bool {
    relative == prefix
        || (relative.len() > prefix.len()
            && relative.starts_with(prefix)
            && relative.as_bytes()[prefix.len()] == b'/')
}

/// Canonicalize when possible, otherwise keep the path as given.
pub fn try_canonicalize(path: &Path) -> PathBuf {
    dunce_like(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}

// Strip the Windows verbatim prefix so comparisons against user input work.
fn dunce_like(path: PathBuf) -> PathBuf {
    if cfg!(windows) {
        let text = path.to_string_lossy();
        if let Some(stripped) = text.strip_prefix(r"\\?\") {
            return PathBuf::from(stripped);
        }
    }
    path
}
