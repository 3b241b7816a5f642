//! Include/exclude filtering of replica paths.
//!
//! Exclude patterns win over include patterns. Include patterns only apply to
//! files so that an include such as `*.txt` still lets the scan descend into
//! the directories holding those files.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path};

use crate::sync::error::{Result, SyncError};
use crate::sync::path_utils;

/// Pure path predicate used by detection and apply.
#[derive(Debug, Clone)]
pub struct Filter {
    include: GlobSet,
    exclude: GlobSet,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter {
    /// Filter that accepts everything outside the state directory.
    pub fn new() -> Self {
        Self {
            include: GlobSet::empty(),
            exclude: GlobSet::empty(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Build from include and exclude glob patterns.
    pub fn from_patterns<I, E>(include: I, exclude: E) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let (include, include_patterns) = Self::build(include)?;
        let (exclude, exclude_patterns) = Self::build(exclude)?;
        Ok(Self {
            include,
            exclude,
            include_patterns,
            exclude_patterns,
        })
    }

    fn build<P>(patterns: P) -> Result<(GlobSet, Vec<String>)>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut list = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let glob = Glob::new(pattern).map_err(|source| SyncError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            builder.add(glob);
            list.push(pattern.to_string());
        }

        let set = builder.build().map_err(|source| SyncError::InvalidPattern {
            pattern: list.join(", "),
            source,
        })?;
        Ok((set, list))
    }

    /// Whether a file at `relative_path` takes part in synchronization.
    pub fn matches(&self, relative_path: &str) -> bool {
        if path_utils::is_reserved(relative_path)
            || path_utils::is_staging(relative_path)
            || self.is_excluded(relative_path)
        {
            return false;
        }
        if self.include_patterns.is_empty() {
            return true;
        }

        if self.include.is_match(relative_path) {
            return true;
        }
        file_name(relative_path)
            .map(|name| self.include.is_match(name))
            .unwrap_or(false)
    }

    /// Whether a directory at `relative_path` takes part in synchronization.
    pub fn matches_dir(&self, relative_path: &str) -> bool {
        !path_utils::is_reserved(relative_path) && !self.is_excluded(relative_path)
    }

    /// Dispatch on the entry kind.
    pub fn matches_entry(&self, relative_path: &str, is_dir: bool) -> bool {
        if is_dir {
            self.matches_dir(relative_path)
        } else {
            self.matches(relative_path)
        }
    }

    fn is_excluded(&self, relative_path: &str) -> bool {
        if self.exclude_patterns.is_empty() {
            return false;
        }
        if self.exclude.is_match(relative_path) {
            return true;
        }

        // A match on any component excludes everything below it
        for component in Path::new(relative_path).components() {
            if let Component::Normal(name) = component {
                if self.exclude.is_match(name.to_string_lossy().as_ref()) {
                    return true;
                }
            }
        }

        false
    }

    pub fn include_patterns(&self) -> &[String] {
        &self.include_patterns
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }
}

fn file_name(relative_path: &str) -> Option<&str> {
    relative_path.rsplit('/').next().filter(|name| !name.is_empty())
}
