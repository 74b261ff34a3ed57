//! Shared mocks: an in-memory hypervisor and a call-recording snapshot
//! provider.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vmbackup::error::{BackupError, Result};
use vmbackup::hypervisor::{DiskInfo, Domain, Hypervisor};
use vmbackup::snapshot::{DiskSnapshot, SnapshotCoordinator, SnapshotProvider, SnapshotSet};

pub struct MockDomain {
    id: i64,
    name: String,
    disks: Mutex<IndexMap<String, DiskInfo>>,
}

impl MockDomain {
    pub fn new(id: i64, name: &str, disks: &[(&str, &Path, &str)]) -> Arc<Self> {
        let disks = disks
            .iter()
            .map(|(dev, source, format)| {
                (
                    dev.to_string(),
                    DiskInfo {
                        source_path: source.to_path_buf(),
                        format: format.to_string(),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            id,
            name: name.to_string(),
            disks: Mutex::new(disks),
        })
    }
}

impl Domain for MockDomain {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn xml_desc(&self) -> Result<String> {
        Ok(format!("<domain><name>{}</name></domain>", self.name))
    }

    fn disks(&self) -> Result<IndexMap<String, DiskInfo>> {
        Ok(self
            .disks
            .lock()
            .map_err(|_| BackupError::Hypervisor("poisoned disk map".to_string()))?
            .clone())
    }
}

pub struct MockHypervisor {
    pub domains: Vec<Arc<MockDomain>>,
}

impl MockHypervisor {
    pub fn new(domains: Vec<Arc<MockDomain>>) -> Self {
        Self { domains }
    }
}

impl Hypervisor for MockHypervisor {
    fn lookup_domain(&self, name: &str) -> Result<Arc<dyn Domain>> {
        self.domains
            .iter()
            .find(|d| d.name() == name)
            .map(|d| Arc::clone(d) as Arc<dyn Domain>)
            .ok_or_else(|| BackupError::DomainNotFound(name.to_string()))
    }

    fn list_domain_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.domains.iter().map(|d| d.name().to_string()).collect())
    }
}

/// Counters shared between a provider and every coordinator it hands out.
#[derive(Default)]
pub struct SnapshotLog {
    pub started: AtomicUsize,
    pub cleaned: AtomicUsize,
    pub recovered: AtomicUsize,
    pub cleaned_disks: Mutex<Vec<String>>,
}

impl SnapshotLog {
    pub fn cleaned_disks(&self) -> Vec<String> {
        self.cleaned_disks.lock().unwrap().clone()
    }
}

pub struct MockSnapshots {
    pub log: Arc<SnapshotLog>,
    /// Coordinators fail their `start` when set.
    pub fail_start: AtomicBool,
    /// Fixed snapshot timestamp, for deterministic artifact names.
    pub fixed_date: Option<DateTime<Local>>,
}

impl MockSnapshots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(SnapshotLog::default()),
            fail_start: AtomicBool::new(false),
            fixed_date: None,
        })
    }

    pub fn with_fixed_date(date: DateTime<Local>) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(SnapshotLog::default()),
            fail_start: AtomicBool::new(false),
            fixed_date: Some(date),
        })
    }
}

impl SnapshotProvider for MockSnapshots {
    fn fresh(
        &self,
        _domain: Arc<dyn Domain>,
        disks: &IndexMap<String, DiskInfo>,
        _timeout: Option<Duration>,
    ) -> Box<dyn SnapshotCoordinator> {
        let disks = disks
            .iter()
            .map(|(dev, info)| {
                let snapshot_path =
                    PathBuf::from(format!("{}.snap", info.source_path.display()));
                (
                    dev.clone(),
                    DiskSnapshot {
                        source_path: info.source_path.clone(),
                        snapshot_path,
                    },
                )
            })
            .collect();
        Box::new(MockCoordinator {
            disks,
            log: Arc::clone(&self.log),
            fail_start: self.fail_start.load(Ordering::Relaxed),
            date: self.fixed_date,
        })
    }

    fn recover(&self, disks: &IndexMap<String, DiskSnapshot>) -> Box<dyn SnapshotCoordinator> {
        self.log.recovered.fetch_add(1, Ordering::Relaxed);
        Box::new(MockCoordinator {
            disks: disks.clone(),
            log: Arc::clone(&self.log),
            fail_start: false,
            date: self.fixed_date,
        })
    }
}

pub struct MockCoordinator {
    disks: IndexMap<String, DiskSnapshot>,
    log: Arc<SnapshotLog>,
    fail_start: bool,
    date: Option<DateTime<Local>>,
}

#[async_trait]
impl SnapshotCoordinator for MockCoordinator {
    async fn start(&mut self) -> Result<SnapshotSet> {
        if self.fail_start {
            return Err(BackupError::Snapshot("injected snapshot failure".to_string()));
        }
        self.log.started.fetch_add(1, Ordering::Relaxed);
        Ok(SnapshotSet {
            timestamp: self.date.unwrap_or_else(Local::now),
            disks: self.disks.clone(),
        })
    }

    async fn clean_for_disk(&mut self, dev: &str) -> Result<()> {
        self.log.cleaned_disks.lock().unwrap().push(dev.to_string());
        Ok(())
    }

    async fn clean(&mut self) -> Result<()> {
        self.log.cleaned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
