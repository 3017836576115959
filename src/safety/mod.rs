//! Safety and cleanup
//!
//! Bounded admission, per-run scratch areas and symlink-safe removal.

pub mod admission;
pub mod safe_cleanup;
pub mod workspace;
