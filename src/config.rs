//! User configuration, read from TOML.
//!
//! ```toml
//! conflict_strategy = "largest-wins"
//! include = ["*.md"]
//! exclude = ["target", "*.tmp"]
//! log_filter = "twinsync=debug"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::sync::conflict::ConflictStrategy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub conflict_strategy: ConflictStrategy,
    /// Extra include patterns, added to the one given on the command line.
    pub include: Vec<String>,
    /// Extra exclude patterns.
    pub exclude: Vec<String>,
    /// `tracing` filter directive used when `RUST_LOG` is not set.
    pub log_filter: Option<String>,
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// `<config dir>/twinsync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("twinsync").join("config.toml"))
    }

    /// Load the default config file when it exists, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}
