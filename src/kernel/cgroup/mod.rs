//! Cgroup resource governance
//!
//! Optional per-run cgroup v2 accounting and OOM containment.

pub mod backend;
pub mod v2;

pub use backend::{create_cgroup_backend, is_cgroup_v2_dir, CgroupBackend, CgroupEvidence};
pub use v2::CgroupV2;
