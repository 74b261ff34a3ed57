//! Host rule resolution against the live domain inventory.
//!
//! A rule is either a literal domain name, `r:<regex>` matched against every
//! inventory name with anchored full-match semantics, or either form with a
//! leading `!` turning the match into an exclusion. The object form carries
//! an optional disk restriction applied to every domain it matches.

use crate::error::{BackupError, Result};
use crate::hypervisor::Hypervisor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One entry of a group's `hosts` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostRule {
    /// Bare pattern string; equivalent to the object form with no disk
    /// restriction.
    Pattern(String),
    Full {
        host: String,
        #[serde(default)]
        disks: Option<Vec<String>>,
    },
}

/// Outcome of evaluating one rule: the matched inventory names, whether the
/// rule excludes them, and the rule's disk restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatch {
    pub domains: BTreeSet<String>,
    pub exclude: bool,
    pub disks: Option<Vec<String>>,
}

/// Match one pattern string against the live inventory. A name or pattern
/// matching nothing yields an empty set, never an error; only a malformed
/// regex fails.
pub fn match_domains_from_pattern(pattern: &str, hypervisor: &dyn Hypervisor) -> Result<HostMatch> {
    let (exclude, matcher) = match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };

    let names = hypervisor.list_domain_names()?;
    let domains = if let Some(expr) = matcher.strip_prefix("r:") {
        let re = Regex::new(&format!("^(?:{expr})$")).map_err(|source| BackupError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        names.into_iter().filter(|name| re.is_match(name)).collect()
    } else {
        names.into_iter().filter(|name| name == matcher).collect()
    };

    Ok(HostMatch {
        domains,
        exclude,
        disks: None,
    })
}

/// Evaluate one host rule, normalizing the bare string form.
pub fn match_domains_from_host_rule(
    rule: &HostRule,
    hypervisor: &dyn Hypervisor,
) -> Result<HostMatch> {
    match rule {
        HostRule::Pattern(pattern) => match_domains_from_pattern(pattern, hypervisor),
        HostRule::Full { host, disks } => {
            let mut matched = match_domains_from_pattern(host, hypervisor)?;
            matched.disks = disks.clone();
            Ok(matched)
        }
    }
}
