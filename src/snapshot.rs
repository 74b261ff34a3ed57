//! External-snapshot coordinator seam.
//!
//! The actual snapshot creation and block-pivot release live in the
//! embedding application (they talk to the hypervisor); a backup job only
//! needs the capability below. The provider exposes the two construction
//! paths: `fresh` for a live run, and `recover` rebuilt from a pending
//! ledger. The latter only knows the recorded snapshot paths, which is all
//! that releasing them requires.

use crate::error::Result;
use crate::hypervisor::{DiskInfo, Domain};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Snapshot state of one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSnapshot {
    /// Image path frozen behind the snapshot; this is what gets extracted.
    pub source_path: PathBuf,
    /// The external snapshot (delta) file created by the coordinator.
    pub snapshot_path: PathBuf,
}

/// Result of snapshotting every selected disk atomically.
#[derive(Debug, Clone)]
pub struct SnapshotSet {
    /// Instant at which all disks were consistently frozen; becomes the
    /// authoritative backup timestamp.
    pub timestamp: DateTime<Local>,
    pub disks: IndexMap<String, DiskSnapshot>,
}

#[async_trait]
pub trait SnapshotCoordinator: Send {
    /// Take an external snapshot of all disks in one atomic operation.
    async fn start(&mut self) -> Result<SnapshotSet>;

    /// Release one disk's snapshot (block pivot + delta removal) as soon as
    /// its extraction is done.
    async fn clean_for_disk(&mut self, dev: &str) -> Result<()>;

    /// Release every remaining snapshot resource. Idempotent.
    async fn clean(&mut self) -> Result<()>;
}

/// Builds coordinators for a job. Each `BackupJob::start` acquires a fresh
/// instance scoped to that run.
pub trait SnapshotProvider: Send + Sync {
    /// Coordinator for a live run.
    fn fresh(
        &self,
        domain: Arc<dyn Domain>,
        disks: &IndexMap<String, DiskInfo>,
        timeout: Option<Duration>,
    ) -> Box<dyn SnapshotCoordinator>;

    /// Coordinator rebuilt from recorded snapshot state, for rolling back an
    /// aborted run after a process restart.
    fn recover(&self, disks: &IndexMap<String, DiskSnapshot>) -> Box<dyn SnapshotCoordinator>;
}
