//! Per-domain backup job lifecycle.
//!
//! A job walks one domain through snapshot, per-disk extraction and archive
//! finalize, keeping a pending ledger on disk the whole time so a crashed or
//! failed run can always be rolled back, either by the failure path of
//! [`BackupJob::start`] or by [`BackupJob::clean_aborted`] in a restarted
//! process.

pub mod definition;
pub mod pending;

use crate::archive::{copy_image, ArchiveWriter, BackupTarget};
use crate::error::{BackupError, Result};
use crate::hypervisor::{DiskInfo, Domain, Hypervisor};
use crate::snapshot::{SnapshotCoordinator, SnapshotProvider};
use definition::{backup_name, BackupDefinition, Compression};
use indexmap::IndexMap;
use pending::{PendingDisk, PendingLedger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Nullable backup policy fields. `None` means "not set here": group
/// defaults fill unset fields at add time and again on explicit
/// re-propagation, so an unset field stays distinguishable from one
/// configured to a value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPolicy {
    /// Directory receiving artifacts, the definition and the ledger.
    pub target_dir: Option<PathBuf>,
    /// Packaging mode; jobs fall back to [`Compression::Store`] at start.
    pub compression: Option<Compression>,
    pub compression_lvl: Option<u32>,
    /// Bound on waiting for a block pivot; enforced by the coordinator.
    pub timeout: Option<Duration>,
}

impl JobPolicy {
    /// Fill every unset field from `defaults`. Set fields are kept.
    pub fn fill_from(&mut self, defaults: &JobPolicy) {
        if self.target_dir.is_none() {
            self.target_dir = defaults.target_dir.clone();
        }
        if self.compression.is_none() {
            self.compression = defaults.compression;
        }
        if self.compression_lvl.is_none() {
            self.compression_lvl = defaults.compression_lvl;
        }
        if self.timeout.is_none() {
            self.timeout = defaults.timeout;
        }
    }
}

/// Backup of one domain's selected disks.
pub struct BackupJob {
    domain: Arc<dyn Domain>,
    provider: Arc<dyn SnapshotProvider>,
    policy: JobPolicy,
    /// Selected disks, processed in insertion order.
    disks: IndexMap<String, DiskInfo>,
    /// Re-entrancy guard: exactly one lifecycle execution in flight.
    running: bool,
    /// In-memory copy of the on-disk ledger, present between the first
    /// snapshot and completion/cleanup of the run.
    pending: Option<PendingLedger>,
    /// Coordinator of the current or aborted run. Replaced on every start.
    coordinator: Option<Box<dyn SnapshotCoordinator>>,
}

impl BackupJob {
    /// Create a job for `domain`. `dev_disks` selects disks by dev name and
    /// fails with [`BackupError::UnknownDisk`] for names the domain does not
    /// currently have; `None` (or an empty list) selects every attached
    /// disk.
    pub fn new(
        domain: Arc<dyn Domain>,
        provider: Arc<dyn SnapshotProvider>,
        policy: JobPolicy,
        dev_disks: Option<&[&str]>,
    ) -> Result<Self> {
        let disks = match dev_disks {
            Some(devs) if !devs.is_empty() => Self::resolve_disks(&*domain, devs)?,
            _ => domain.disks()?,
        };
        Ok(Self {
            domain,
            provider,
            policy,
            disks,
            running: false,
            pending: None,
            coordinator: None,
        })
    }

    /// Rebuild a job from a leftover pending ledger, typically found by
    /// [`PendingLedger::scan`] after a process restart. The domain is looked
    /// up by its recorded name and the recorded dev names are re-resolved;
    /// the job is then ready for [`BackupJob::clean_aborted`].
    pub fn from_pending(
        hypervisor: &dyn Hypervisor,
        provider: Arc<dyn SnapshotProvider>,
        target_dir: &Path,
        ledger: PendingLedger,
    ) -> Result<Self> {
        let domain = hypervisor.lookup_domain(&ledger.domain_name)?;
        let devs: Vec<&str> = ledger.disks.keys().map(String::as_str).collect();
        let policy = JobPolicy {
            target_dir: Some(target_dir.to_path_buf()),
            compression: Some(ledger.compression),
            compression_lvl: ledger.compression_lvl,
            timeout: None,
        };
        let mut job = Self::new(domain, provider, policy, Some(&devs))?;
        job.pending = Some(ledger);
        Ok(job)
    }

    fn resolve_disks(domain: &dyn Domain, devs: &[&str]) -> Result<IndexMap<String, DiskInfo>> {
        let all = domain.disks()?;
        let mut selected = IndexMap::with_capacity(devs.len());
        for dev in devs {
            let info = all.get(*dev).cloned().ok_or_else(|| BackupError::UnknownDisk {
                domain: domain.name().to_string(),
                dev: dev.to_string(),
            })?;
            selected.insert(dev.to_string(), info);
        }
        Ok(selected)
    }

    /// Add disks by dev name, re-resolving the domain's current disk set.
    /// An empty `devs` replaces the selection with every attached disk.
    ///
    /// Calling this while a backup is running can disagree with the live
    /// attachment set, because the external snapshots taken by the run
    /// change it. Known limitation; correct handling needs backing-store
    /// chain awareness.
    pub fn add_disks(&mut self, devs: &[&str]) -> Result<()> {
        let all = self.domain.disks()?;
        if devs.is_empty() {
            self.disks = all;
            return Ok(());
        }
        for dev in devs {
            if self.disks.contains_key(*dev) {
                continue;
            }
            let info = all.get(*dev).cloned().ok_or_else(|| BackupError::UnknownDisk {
                domain: self.domain.name().to_string(),
                dev: dev.to_string(),
            })?;
            self.disks.insert(dev.to_string(), info);
        }
        Ok(())
    }

    pub fn domain(&self) -> &Arc<dyn Domain> {
        &self.domain
    }

    pub fn domain_id(&self) -> i64 {
        self.domain.id()
    }

    pub fn domain_name(&self) -> &str {
        self.domain.name()
    }

    pub fn disks(&self) -> &IndexMap<String, DiskInfo> {
        &self.disks
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    pub fn target_dir(&self) -> Option<&Path> {
        self.policy.target_dir.as_deref()
    }

    pub fn set_target_dir(&mut self, dir: PathBuf) {
        self.policy.target_dir = Some(dir);
    }

    /// Fill unset policy fields from a group's defaults.
    pub fn apply_defaults(&mut self, defaults: &JobPolicy) {
        self.policy.fill_from(defaults);
    }

    /// Jobs are compatible when they reference the same domain and share
    /// target directory, compression mode and compression level. Disk
    /// contents do not matter; this gates merge decisions.
    pub fn compatible_with(&self, other: &BackupJob) -> bool {
        self.policy.target_dir == other.policy.target_dir
            && self.policy.compression == other.policy.compression
            && self.policy.compression_lvl == other.policy.compression_lvl
            && self.domain.id() == other.domain.id()
    }

    /// Absorb `other`'s disk selection; an already-set timeout wins over
    /// the other job's.
    pub fn merge_with(&mut self, other: &BackupJob) -> Result<()> {
        let devs: Vec<&str> = other.disks.keys().map(String::as_str).collect();
        self.add_disks(&devs)?;
        if self.policy.timeout.is_none() {
            self.policy.timeout = other.policy.timeout;
        }
        Ok(())
    }

    /// Run the entire backup for the selected disks.
    ///
    /// Fails fast with [`BackupError::AlreadyRunning`] on a re-entrant call
    /// and [`BackupError::MissingTargetDir`] when no target directory is
    /// set. Any failure after snapshotting triggers abort-and-cleanup before
    /// the original error is returned; the running flag is cleared on every
    /// exit.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(BackupError::AlreadyRunning(self.domain.name().to_string()));
        }
        let target_dir = self
            .policy
            .target_dir
            .clone()
            .ok_or_else(|| BackupError::MissingTargetDir(self.domain.name().to_string()))?;

        info!(domain = %self.domain.name(), target = %target_dir.display(), "backup started");
        tokio::fs::create_dir_all(&target_dir).await?;

        self.running = true;
        // Fresh coordinator scoped to this run; any previous one is dropped.
        self.coordinator = None;
        let mut coordinator =
            self.provider
                .fresh(Arc::clone(&self.domain), &self.disks, self.policy.timeout);

        let result = self.run(&mut coordinator, &target_dir).await;
        match result {
            Ok(()) => {
                self.coordinator = None;
                self.running = false;
                info!(domain = %self.domain.name(), "backup finished");
                Ok(())
            }
            Err(err) => {
                self.coordinator = Some(coordinator);
                if let Err(clean_err) = self.clean_aborted().await {
                    // never mask the original failure with a cleanup error
                    warn!(
                        domain = %self.domain.name(),
                        error = %clean_err,
                        "cleanup after failed backup also failed"
                    );
                }
                self.running = false;
                Err(err)
            }
        }
    }

    async fn run(
        &mut self,
        coordinator: &mut Box<dyn SnapshotCoordinator>,
        target_dir: &Path,
    ) -> Result<()> {
        let compression = self.policy.compression.unwrap_or_default();
        let mut definition = self.definition_skeleton(compression)?;

        // Snapshot every disk in one atomic operation; the instant all of
        // them are frozen is the backup date.
        let snapshots = coordinator.start().await?;
        definition.date = Some(snapshots.timestamp);

        let mut ledger = PendingLedger {
            compression,
            compression_lvl: self.policy.compression_lvl,
            domain_id: definition.domain_id,
            domain_name: definition.domain_name.clone(),
            domain_xml: definition.domain_xml.clone(),
            version: definition.version.clone(),
            date: snapshots.timestamp,
            disks: IndexMap::with_capacity(self.disks.len()),
            archive: None,
        };
        for (dev, disk) in &self.disks {
            let snapshot = snapshots.disks.get(dev).ok_or_else(|| {
                BackupError::Snapshot(format!("no snapshot metadata for disk {dev}"))
            })?;
            ledger.disks.insert(
                dev.clone(),
                PendingDisk {
                    source_path: disk.source_path.clone(),
                    snapshot_path: snapshot.snapshot_path.clone(),
                    archived: None,
                },
            );
        }
        self.persist_ledger(&ledger, target_dir).await?;

        let name = backup_name(&snapshots.timestamp, definition.domain_id, &definition.domain_name);
        let mut target = if compression.archives() {
            let archive_name = format!("{}.{}", name, compression.extension());
            let path = target_dir.join(&archive_name);
            let level = self.policy.compression_lvl;
            let writer = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || ArchiveWriter::create(&path, compression, level))
                    .await??
            };
            // Recorded only once the file exists, so cleanup never deletes
            // an archive this run did not create.
            ledger.archive = Some(archive_name.clone());
            definition.archive = Some(archive_name);
            self.persist_ledger(&ledger, target_dir).await?;
            BackupTarget::Archive(writer)
        } else {
            BackupTarget::Directory(target_dir.to_path_buf())
        };

        let selected: Vec<(String, DiskInfo)> = self
            .disks
            .iter()
            .map(|(dev, disk)| (dev.clone(), disk.clone()))
            .collect();
        for (dev, disk) in selected {
            info!(domain = %self.domain.name(), disk = %dev, "backing up disk");
            let image_name = format!("{}_{}.{}", name, dev, disk.format);

            if let Some(entry) = ledger.disks.get_mut(&dev) {
                entry.archived = Some(image_name.clone());
            }
            self.persist_ledger(&ledger, target_dir).await?;
            definition.disks.insert(dev.clone(), image_name.clone());

            target = {
                let source = disk.source_path.clone();
                tokio::task::spawn_blocking(move || -> Result<BackupTarget> {
                    match &mut target {
                        BackupTarget::Directory(dir) => {
                            copy_image(&source, dir, &image_name)?;
                        }
                        BackupTarget::Archive(writer) => {
                            writer.append_file(&source, &image_name)?;
                        }
                    }
                    Ok(target)
                })
                .await??
            };
            debug!(domain = %self.domain.name(), disk = %dev, "disk extracted");

            // Release this disk's snapshot right away to bound the transient
            // storage held by open deltas.
            coordinator.clean_for_disk(&dev).await?;
        }

        definition.save(target_dir, &name).await?;
        coordinator.clean().await?;
        if let BackupTarget::Archive(writer) = target {
            tokio::task::spawn_blocking(move || writer.finish()).await??;
        }
        ledger.remove(target_dir).await?;
        self.pending = None;
        Ok(())
    }

    async fn persist_ledger(&mut self, ledger: &PendingLedger, target_dir: &Path) -> Result<()> {
        ledger.save(target_dir).await?;
        self.pending = Some(ledger.clone());
        Ok(())
    }

    fn definition_skeleton(&self, compression: Compression) -> Result<BackupDefinition> {
        Ok(BackupDefinition {
            compression,
            compression_lvl: self.policy.compression_lvl,
            domain_id: self.domain.id(),
            domain_name: self.domain.name().to_string(),
            domain_xml: self.domain.xml_desc()?,
            version: crate::VERSION.to_string(),
            date: None,
            disks: IndexMap::new(),
            archive: None,
        })
    }

    /// Roll back an aborted run: release every snapshot, delete the partial
    /// archive or per-disk outputs recorded in the ledger, then delete the
    /// ledger itself. Idempotent.
    ///
    /// When no coordinator is live but the ledger shows snapshotted disks
    /// (the state a restarted process finds itself in), a recovery
    /// coordinator is rebuilt from the recorded snapshot paths. Snapshot
    /// release failures propagate (and leave the ledger in place for a
    /// retry); artifact deletion failures are logged and swallowed so they
    /// never block the rest of the recovery.
    pub async fn clean_aborted(&mut self) -> Result<()> {
        if self.coordinator.is_none() {
            if let Some(ledger) = &self.pending {
                if !ledger.disks.is_empty() {
                    self.coordinator = Some(self.provider.recover(&ledger.snapshots()));
                }
            }
        }
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.clean().await?;
        }
        self.coordinator = None;

        if let Some(ledger) = self.pending.take() {
            if let Some(dir) = self.policy.target_dir.clone() {
                match &ledger.archive {
                    Some(archive_name) => {
                        remove_artifact(&dir.join(archive_name)).await;
                    }
                    None => {
                        for disk in ledger.disks.values() {
                            if let Some(file_name) = &disk.archived {
                                remove_artifact(&dir.join(file_name)).await;
                            }
                        }
                    }
                }
                if let Err(err) = ledger.remove(&dir).await {
                    warn!(
                        domain = %self.domain.name(),
                        error = %err,
                        "could not remove pending ledger"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Best-effort deletion of a partial artifact. A missing file is fine (the
/// run may have failed before producing it); other errors are logged.
async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial artifact"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial artifact"),
    }
}
