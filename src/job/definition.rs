//! Durable success records and canonical artifact naming.

use crate::error::Result;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How extracted disk images get packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Plain copy of every disk image into the target directory.
    None,
    /// Single uncompressed tar archive.
    #[default]
    Store,
    Gz,
    Bz2,
    Xz,
}

impl Compression {
    /// Whether disks get packaged into a shared archive file.
    pub fn archives(self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Archive file extension for this mode. Empty for plain copies.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Store => "tar",
            Compression::Gz => "tar.gz",
            Compression::Bz2 => "tar.bz2",
            Compression::Xz => "tar.xz",
        }
    }
}

/// Canonical backup name: `YYYYMMDD-HHMMSS_<id>_<name>`, shared by the
/// archive, the definition and the pending ledger of one run.
pub fn backup_name(date: &DateTime<Local>, domain_id: i64, domain_name: &str) -> String {
    format!("{}_{}_{}", date.format("%Y%m%d-%H%M%S"), domain_id, domain_name)
}

/// Per-disk standalone file name (without the image format extension).
pub fn disk_backup_name(
    date: &DateTime<Local>,
    domain_id: i64,
    domain_name: &str,
    dev: &str,
) -> String {
    format!("{}_{}", backup_name(date, domain_id, domain_name), dev)
}

/// The durable record of one completed backup, serialized as `<name>.json`
/// next to the produced artifacts. Written exactly once, on full success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDefinition {
    pub compression: Compression,
    pub compression_lvl: Option<u32>,
    pub domain_id: i64,
    pub domain_name: String,
    /// Domain XML descriptor captured at backup time.
    pub domain_xml: String,
    /// Tool version that produced this backup.
    pub version: String,
    /// Snapshot instant, authoritative because all disks were frozen then.
    /// `None` only while the skeleton is being assembled; the persisted
    /// record always carries it.
    pub date: Option<DateTime<Local>>,
    /// `dev name -> archived file name` for every backed-up disk.
    #[serde(default)]
    pub disks: IndexMap<String, String>,
    /// Shared archive file name, when `compression` archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl BackupDefinition {
    /// Persist as `<name>.json` in `dir`. Written to a temp file first and
    /// renamed into place so the record becomes visible atomically.
    pub async fn save(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let path = dir.join(format!("{name}.json"));
        let tmp = dir.join(format!("{name}.json.tmp"));
        let payload = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}
