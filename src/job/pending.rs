//! The pending ledger: the crash-recovery record of an in-progress backup.
//!
//! The ledger is written as `<name>.json.pending` right after all disks are
//! snapshotted, rewritten after every disk-level state change, and removed
//! only once the backup definition is durably written or cleanup finished.
//! Its presence on disk means that run left snapshots or partial artifacts
//! behind.

use crate::error::Result;
use crate::job::definition::{backup_name, Compression};
use crate::snapshot::DiskSnapshot;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// In-progress state of one disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDisk {
    /// Image path frozen behind the external snapshot.
    pub source_path: PathBuf,
    /// The snapshot delta file holding writes since the freeze.
    pub snapshot_path: PathBuf,
    /// Output file name, recorded once this disk's extraction produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<String>,
}

/// Serialized in-progress record, mirroring the definition's identity
/// fields plus the recovery state per disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLedger {
    pub compression: Compression,
    pub compression_lvl: Option<u32>,
    pub domain_id: i64,
    pub domain_name: String,
    pub domain_xml: String,
    pub version: String,
    /// Snapshot instant; the ledger only exists after snapshotting.
    pub date: DateTime<Local>,
    #[serde(default)]
    pub disks: IndexMap<String, PendingDisk>,
    /// Archive file name, once one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

impl PendingLedger {
    pub fn file_name(&self) -> String {
        format!(
            "{}.json.pending",
            backup_name(&self.date, self.domain_id, &self.domain_name)
        )
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Rewrite the ledger in `dir`. Called after every state transition.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(self.path(dir), payload).await?;
        Ok(())
    }

    pub async fn remove(&self, dir: &Path) -> Result<()> {
        tokio::fs::remove_file(self.path(dir)).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let payload = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Recorded snapshot state, in the shape the snapshot provider's
    /// recovery constructor expects.
    pub fn snapshots(&self) -> IndexMap<String, DiskSnapshot> {
        self.disks
            .iter()
            .map(|(dev, disk)| {
                (
                    dev.clone(),
                    DiskSnapshot {
                        source_path: disk.source_path.clone(),
                        snapshot_path: disk.snapshot_path.clone(),
                    },
                )
            })
            .collect()
    }

    /// Find every leftover ledger in `dir`. Unparsable files are logged and
    /// skipped so one corrupt ledger cannot block recovery of the others.
    pub async fn scan(dir: &Path) -> Result<Vec<(PathBuf, PendingLedger)>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_ledger = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json.pending"))
                .unwrap_or(false);
            if !is_ledger {
                continue;
            }
            match Self::load(&path).await {
                Ok(ledger) => found.push((path, ledger)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable pending ledger");
                }
            }
        }
        Ok(found)
    }
}
