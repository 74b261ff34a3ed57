//! Hypervisor collaborator traits.
//!
//! The live connection, domain XML parsing and disk enumeration are provided
//! by the embedding application; the library only depends on these seams.

use crate::error::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// One attached disk image as reported by the domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Path of the backing image on the host.
    pub source_path: PathBuf,
    /// Image format (`qcow2`, `raw`, ...), used as the extension of
    /// extracted per-disk files.
    pub format: String,
}

/// A handle on one defined domain.
pub trait Domain: Send + Sync {
    /// Hypervisor-assigned domain id; domain identity for dedup decisions.
    fn id(&self) -> i64;

    fn name(&self) -> &str;

    /// Full XML descriptor, captured verbatim into the backup definition.
    fn xml_desc(&self) -> Result<String>;

    /// Current disk attachment set, `dev name -> DiskInfo`, in descriptor
    /// order. Taking external snapshots changes this set.
    fn disks(&self) -> Result<IndexMap<String, DiskInfo>>;
}

/// A connection to the hypervisor, enough to resolve host patterns and
/// rebuild jobs from recovery records.
pub trait Hypervisor: Send + Sync {
    fn lookup_domain(&self, name: &str) -> Result<Arc<dyn Domain>>;

    fn list_domain_names(&self) -> Result<BTreeSet<String>>;
}
