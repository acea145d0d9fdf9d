//! Storage configuration and path management for the pulse node.
//!
//! All file locations are decided here so the rest of the code never joins
//! paths by hand. Production code resolves the root from `PULSE_HOME` or
//! falls back to `~/.pulse`; tests use [`StorageConfig::with_root`] with a
//! temp directory.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{PulseError, Result};

pub const HOME_ENV: &str = "PULSE_HOME";
const DEFAULT_DIR_NAME: &str = ".pulse";

/// Central configuration for all pulse storage paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Resolves the storage root: `PULSE_HOME` if set and non-empty,
    /// otherwise `~/.pulse`.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = dirs::home_dir().ok_or(PulseError::HomeDirNotFound)?;
        Ok(Self::with_root(home.join(DEFAULT_DIR_NAME)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to state.json (the persisted snapshot).
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Path to account.json (credentials and tokens from the last login).
    pub fn account_file(&self) -> PathBuf {
        self.root.join("account.json")
    }

    /// Path to config.toml (optional overrides).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
