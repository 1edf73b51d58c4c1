//! VFS tunables loaded from TOML.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VfsError, VfsResult};

/// Runtime configuration for a `VfsContext`.
///
/// ```toml
/// timeout_secs = 60      # idle instances are freed after this long
/// dir_cache_secs = 900   # linear-family directory listings stay fresh this long
/// max_handles = 100
/// temp_dir = "/var/tmp"
/// tilde_expand = true
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    pub timeout_secs: u64,
    pub dir_cache_secs: u64,
    pub max_handles: usize,
    /// Where local copies are materialized. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    pub tilde_expand: bool,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            dir_cache_secs: 900,
            max_handles: 100,
            temp_dir: None,
            tilde_expand: true,
        }
    }
}

impl VfsConfig {
    /// Parse a configuration document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> VfsResult<Self> {
        toml::from_str(content).map_err(|e| VfsError::other(format!("bad vfs config: {e}")))
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> VfsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VfsError::from_io(e, path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn dir_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.dir_cache_secs)
    }

    /// Directory for temp files.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
