//! UID/GID transitions for privilege dropping.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid.

mod transition;

pub use transition::{validate_ids, CredentialPlan};
