//! Tool configuration
//!
//! The config file names the repository and catalog locations, the backup
//! roots with their retention policies, and the exclude patterns handed to
//! the search feed. It is stored as JSON and is itself tracked by the
//! catalog's config history on every backup.

use crate::error::{KeepsakeError, Result};
use crate::types::Policy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One backup root and the policy applied below it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSpec {
    /// Absolute path of the subtree to track
    pub path: PathBuf,
    /// Retention policy for every entry below the root
    pub policy: Policy,
}

/// On-disk configuration of the tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Content store location
    pub repository: PathBuf,
    /// Catalog (metadata) file location
    pub catalog: PathBuf,
    /// Tracked subtrees
    pub roots: Vec<RootSpec>,
    /// Exclude patterns (glob syntax), matched against paths and file names
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::InvalidConfiguration`] if the file is missing or
    ///   a setting is unusable
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|e| {
            KeepsakeError::invalid_config(format!("cannot read {:?}: {}", path, e))
        })?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Check the configuration for unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.roots.is_empty() {
            return Err(KeepsakeError::invalid_config("no backup roots configured"));
        }
        for root in &self.roots {
            if !root.path.is_absolute() {
                return Err(KeepsakeError::invalid_config(format!(
                    "backup root {:?} must be absolute",
                    root.path
                )));
            }
        }
        Ok(())
    }

    /// Roots in the shape the search feed consumes
    pub fn search_roots(&self) -> Vec<(PathBuf, Policy)> {
        self.roots
            .iter()
            .map(|r| (r.path.clone(), r.policy))
            .collect()
    }

    /// A starter configuration tracking `root`, storing everything under
    /// `state_dir`
    pub fn starter(root: PathBuf, state_dir: &Path) -> Config {
        Config {
            repository: state_dir.join("repo"),
            catalog: state_dir.join("catalog.bin"),
            roots: vec![RootSpec {
                path: root,
                policy: Policy::Copy,
            }],
            excludes: Vec::new(),
        }
    }
}
