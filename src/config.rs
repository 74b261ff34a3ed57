//! Configuration model for backup groups.
//!
//! Loaded from a TOML file; each `[groups.<name>]` table becomes one
//! [`crate::group::JobGroup`] via [`crate::group::groups_from_config`].

use crate::group::pattern::HostRule;
use crate::job::definition::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Directory receiving this group's backups.
    pub target: Option<PathBuf>,

    /// Packaging mode (`none`, `store`, `gz`, `bz2`, `xz`).
    pub compression: Option<Compression>,

    /// Compression level (gzip/bzip2) or preset (xz).
    pub compression_lvl: Option<u32>,

    /// Seconds to wait for a block pivot before failing a job.
    pub timeout: Option<u64>,

    /// Whether the embedding application starts this group on its schedule.
    #[serde(default)]
    pub autostart: bool,

    // Retention counts, consumed by the external rotation policy. Parsed so
    // config files carrying them stay valid, never part of the job policy.
    pub hourly: Option<u32>,
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
    pub yearly: Option<u32>,

    /// Host selection rules, resolved against the live inventory.
    #[serde(default)]
    pub hosts: Vec<HostRule>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
