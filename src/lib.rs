//! Backs up running virtual machines through hypervisor external snapshots.
//!
//! A [`job::BackupJob`] drives one domain through snapshot, per-disk image
//! extraction and archive finalize, persisting a pending ledger after every
//! state change so an interrupted run can be rolled back. A
//! [`group::JobGroup`] deduplicates jobs targeting the same domain and runs
//! them sequentially or through a bounded worker pool, aggregating failures
//! without aborting sibling jobs.
//!
//! The hypervisor connection and the external-snapshot primitive are
//! injected through the [`hypervisor`] and [`snapshot`] traits.

pub mod archive;
pub mod config;
pub mod error;
pub mod group;
pub mod hypervisor;
pub mod job;
pub mod snapshot;

pub use error::{BackupError, GroupFailure, Result};

/// Tool version recorded in every backup definition.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
