//! Backup groups: deduplicated jobs sharing default policy, run either
//! sequentially or through a bounded worker pool.

pub mod pattern;

use crate::config::GroupConfig;
use crate::error::{BackupError, GroupFailure, Result};
use crate::hypervisor::{Domain, Hypervisor};
use crate::job::{BackupJob, JobPolicy};
use crate::snapshot::SnapshotProvider;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// A named set of backup jobs, at most one per domain, sharing the group's
/// default policy.
pub struct JobGroup {
    name: String,
    defaults: JobPolicy,
    /// When set, each job backs up into `<target>/<domain name>/`.
    dirs_per_domain: bool,
    provider: Arc<dyn SnapshotProvider>,
    jobs: Vec<BackupJob>,
}

impl JobGroup {
    pub fn new(
        name: impl Into<String>,
        defaults: JobPolicy,
        provider: Arc<dyn SnapshotProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            defaults,
            dirs_per_domain: false,
            provider,
            jobs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs(&self) -> &[BackupJob] {
        &self.jobs
    }

    pub fn defaults(&self) -> &JobPolicy {
        &self.defaults
    }

    /// Group defaults, mutable. Changing them affects existing jobs only
    /// through [`JobGroup::propagate_default_policy`].
    pub fn defaults_mut(&mut self) -> &mut JobPolicy {
        &mut self.defaults
    }

    pub fn set_dirs_per_domain(&mut self, enabled: bool) {
        self.dirs_per_domain = enabled;
    }

    /// Add a backup job for `domain`, seeded with the group defaults. When
    /// the domain already has a job, the disk selection is merged into it
    /// instead (`None` or an empty list meaning every attached disk).
    pub fn add_domain(&mut self, domain: Arc<dyn Domain>, disks: Option<&[&str]>) -> Result<()> {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.domain_id() == domain.id()) {
            return job.add_disks(disks.unwrap_or(&[]));
        }
        let job = BackupJob::new(
            domain,
            Arc::clone(&self.provider),
            self.defaults.clone(),
            disks,
        )?;
        self.jobs.push(job);
        Ok(())
    }

    /// Add an already-constructed job, merging it into the first compatible
    /// existing job rather than duplicating the domain.
    pub fn add_job(&mut self, job: BackupJob) -> Result<()> {
        for existing in &mut self.jobs {
            if existing.compatible_with(&job) {
                return existing.merge_with(&job);
            }
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Jobs referencing `domain`. Empty iterator when none match; callers
    /// needing exactly one must check for themselves.
    pub fn search<'a>(&'a self, domain: &'a dyn Domain) -> impl Iterator<Item = &'a BackupJob> + 'a {
        self.jobs.iter().filter(move |j| j.domain_id() == domain.id())
    }

    /// Fill every job's unset policy fields from the current defaults.
    /// Fields a job already carries, whether configured or seeded earlier,
    /// are kept.
    pub fn propagate_default_policy(&mut self) {
        for job in &mut self.jobs {
            job.apply_defaults(&self.defaults);
        }
    }

    /// Re-root a job's target at `<target>/<domain name>` once. Skipped when
    /// the path already ends with the domain name, so restarted groups do
    /// not nest directories.
    fn ensure_domain_dir(job: &mut BackupJob) {
        let Some(dir) = job.target_dir() else { return };
        if dir.file_name() == Some(OsStr::new(job.domain_name())) {
            return;
        }
        let dir = dir.join(job.domain_name());
        job.set_target_dir(dir);
    }

    fn finish(&self, failures: Vec<(String, BackupError)>) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        Err(GroupFailure {
            group: self.name.clone(),
            failures,
        }
        .into())
    }

    /// Run every job in insertion order. A job failure is recorded and the
    /// remaining jobs still run; after the last one, any recorded failures
    /// surface as one [`GroupFailure`] listing all of them.
    pub async fn start(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for job in &mut self.jobs {
            if self.dirs_per_domain {
                Self::ensure_domain_dir(job);
            }
            let domain = job.domain_name().to_string();
            info!(group = %self.name, domain = %domain, "starting backup job");
            if let Err(err) = job.start().await {
                warn!(group = %self.name, domain = %domain, error = %err, "backup job failed");
                failures.push((domain, err));
            }
        }
        self.finish(failures)
    }

    /// Same contract as [`JobGroup::start`], but runs up to `max_workers`
    /// jobs at once. Failure order inside the aggregate is unspecified; the
    /// set is complete, and one job failing never cancels the others.
    pub async fn start_concurrent(&mut self, max_workers: usize) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut handles = Vec::with_capacity(self.jobs.len());

        for mut job in self.jobs.drain(..) {
            if self.dirs_per_domain {
                Self::ensure_domain_dir(&mut job);
            }
            let semaphore = Arc::clone(&semaphore);
            let group = self.name.clone();
            handles.push(tokio::spawn(async move {
                // the semaphore is never closed, so acquisition cannot fail
                let _permit = semaphore.acquire_owned().await.ok();
                let domain = job.domain_name().to_string();
                info!(group = %group, domain = %domain, "starting backup job");
                let result = job.start().await;
                if let Err(err) = &result {
                    warn!(group = %group, domain = %domain, error = %err, "backup job failed");
                }
                (job, result)
            }));
        }

        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((job, result)) => {
                    if let Err(err) = result {
                        failures.push((job.domain_name().to_string(), err));
                    }
                    self.jobs.push(job);
                }
                Err(join_err) => {
                    // a panicked task still counts as a failed job
                    failures.push(("<panicked job>".to_string(), join_err.into()));
                }
            }
        }
        self.finish(failures)
    }
}

/// Build one group per config entry, in config iteration order. Host rules
/// are resolved against the live inventory: inclusion matches are unioned
/// first, then every domain matched by an exclusion rule is removed,
/// regardless of rule order.
pub fn groups_from_config(
    groups: &BTreeMap<String, GroupConfig>,
    hypervisor: &dyn Hypervisor,
    provider: &Arc<dyn SnapshotProvider>,
) -> Result<Vec<JobGroup>> {
    let mut built = Vec::with_capacity(groups.len());
    for (name, config) in groups {
        built.push(group_from_config(name, config, hypervisor, provider)?);
    }
    Ok(built)
}

fn group_from_config(
    name: &str,
    config: &GroupConfig,
    hypervisor: &dyn Hypervisor,
    provider: &Arc<dyn SnapshotProvider>,
) -> Result<JobGroup> {
    // Only backup policy becomes the group default; the retention counts in
    // the config belong to the external rotation collaborator.
    let defaults = JobPolicy {
        target_dir: config.target.clone(),
        compression: config.compression,
        compression_lvl: config.compression_lvl,
        timeout: config.timeout.map(Duration::from_secs),
    };
    let mut group = JobGroup::new(name, defaults, Arc::clone(provider));

    let mut matches = Vec::new();
    let mut excluded = BTreeSet::new();
    for rule in &config.hosts {
        let matched = pattern::match_domains_from_host_rule(rule, hypervisor)?;
        if matched.exclude {
            excluded.extend(matched.domains);
        } else {
            matches.push(matched);
        }
    }

    for matched in matches {
        let devs: Option<Vec<&str>> = matched
            .disks
            .as_ref()
            .map(|disks| disks.iter().map(String::as_str).collect());
        for domain_name in &matched.domains {
            if excluded.contains(domain_name) {
                continue;
            }
            let domain = hypervisor.lookup_domain(domain_name)?;
            group.add_domain(domain, devs.as_deref())?;
        }
    }

    info!(group = %group.name, jobs = group.jobs.len(), "group resolved from config");
    Ok(group)
}
