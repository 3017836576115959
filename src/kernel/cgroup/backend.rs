//! Cgroup backend abstraction.

use crate::config::types::{ResourceProfile, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Counters read from a run's cgroup after the run has been reaped
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupEvidence {
    pub memory_peak: Option<u64>,
    pub oom_kill_events: u64,
    /// Fork attempts refused because pids.max was reached
    pub pids_max_events: u64,
    pub cpu_usage_usec: Option<u64>,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    /// Create the run cgroup and write its ceilings
    fn create(&self, instance_id: &str, profile: &ResourceProfile) -> Result<()>;
    /// File the child writes "0" into to join the cgroup before exec
    fn procs_path(&self, instance_id: &str) -> PathBuf;
    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence>;
    /// Kill every member of the cgroup
    fn kill_all(&self, instance_id: &str) -> Result<()>;
    fn is_empty(&self, instance_id: &str) -> Result<bool>;
    fn remove(&self, instance_id: &str) -> Result<()>;
    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf;
}

/// Whether `parent` is a usable cgroup v2 directory.
pub fn is_cgroup_v2_dir(parent: &Path) -> bool {
    parent.join("cgroup.controllers").exists() && parent.join("cgroup.subtree_control").exists()
}

/// Create the backend for a configured parent directory.
pub fn create_cgroup_backend(parent: &Path) -> Result<Box<dyn CgroupBackend>> {
    log::info!("Using cgroup v2 backend under {}", parent.display());
    Ok(Box::new(crate::kernel::cgroup::v2::CgroupV2::new(parent)?))
}
