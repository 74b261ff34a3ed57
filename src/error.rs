//! Error types for the backup library.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup already running for domain {0}")]
    AlreadyRunning(String),

    #[error("no target directory set for domain {0}")]
    MissingTargetDir(String),

    #[error("disk {dev} not found on domain {domain}")]
    UnknownDisk { domain: String, dev: String },

    #[error("archive already exists: {0}")]
    ArchiveExists(PathBuf),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("timed out waiting for block pivot on {0}")]
    Timeout(String),

    #[error("invalid host pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Group(#[from] GroupFailure),
}

/// Aggregate failure for a group run: one entry per job whose `start` failed.
///
/// Never constructed with an empty failure list; sibling jobs keep their
/// results regardless of how many entries end up in here.
#[derive(Error, Debug)]
#[error("{} backup(s) failed in group {group:?}", failures.len())]
pub struct GroupFailure {
    pub group: String,
    /// `(domain name, error)` per failed job.
    pub failures: Vec<(String, BackupError)>,
}

pub type Result<T> = std::result::Result<T, BackupError>;
