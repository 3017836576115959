//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> process_tree -> namespace -> credentials -> rlimits -> cgroup

pub mod cgroup;
pub mod credentials;
pub mod namespace;
pub mod probe;
pub mod process_tree;
pub mod rlimits;
pub mod signal;
