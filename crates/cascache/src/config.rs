//! Construction parameters for a disk cache
//!
//! ```toml
//! cache_root = "/var/lib/cascache"
//! alien_cache = true
//! alien_cache_on_nfs = false
//! read_only = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Disk cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding shards and the transaction directory
    pub cache_root: PathBuf,

    /// Share the root with other processes (group-writable files)
    #[serde(default)]
    pub alien_cache: bool,

    /// The shared root lives on a filesystem without reliable rename
    #[serde(default)]
    pub alien_cache_on_nfs: bool,

    /// Start in read-only mode
    #[serde(default)]
    pub read_only: bool,
}

impl CacheConfig {
    /// Exclusive, writable cache at `cache_root`
    pub fn new<P: AsRef<Path>>(cache_root: P) -> Self {
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
            alien_cache: false,
            alien_cache_on_nfs: false,
            read_only: false,
        }
    }

    /// Toggle the shared permission profile
    pub fn alien(mut self, alien_cache: bool) -> Self {
        self.alien_cache = alien_cache;
        self
    }

    /// Toggle link/unlink publishing for network filesystems
    pub fn on_nfs(mut self, on_nfs: bool) -> Self {
        self.alien_cache_on_nfs = on_nfs;
        self
    }

    /// Toggle the initial read-only mode
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// NFS handling only applies to alien caches
    pub fn effective_nfs(&self) -> bool {
        self.alien_cache && self.alien_cache_on_nfs
    }

    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(input)?;
        if config.cache_root.as_os_str().is_empty() {
            return Err(Error::Config("cache_root must not be empty".to_string()));
        }
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
