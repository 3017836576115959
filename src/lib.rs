//! execbox: run untrusted programs under kernel-enforced limits
//!
//! One request in, exactly one result out. Every run gets a private scratch
//! directory, a scrubbed environment, resource limits, and a supervisor that
//! kills the whole process tree when any limit trips.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::rlimits`]: Per-process resource limits applied before exec
//! - [`kernel::namespace`]: Network and mount namespace isolation
//! - [`kernel::cgroup`]: Optional cgroup v2 accounting and group kill
//! - [`kernel::credentials`]: Dropping to the unprivileged service identity
//! - [`kernel::process_tree`]: `/proc` tracking of every descendant
//! - [`kernel::signal`]: Escalating termination of the whole tree
//! - [`kernel::probe`]: Which controls this host can actually enforce
//!
//! ## Execution Control ([`exec`], [`core`])
//! - [`exec::preexec`]: Type-state enforced pre-exec ordering
//! - [`core::sandbox`]: Launching the child into its sandbox
//! - [`core::supervisor`]: Watchdogs, reaping, and teardown
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::verdict`]: Evidence-backed outcome classification
//! - [`verdict::result`]: Evidence + verdict -> [`ExecutionResult`]
//!
//! ## Safety ([`safety`])
//! - [`safety::admission`]: Bounded concurrency with a FIFO wait queue
//! - [`safety::workspace`]: Run-scoped scratch directories
//! - [`safety::safe_cleanup`]: Symlink-safe recursive removal
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Outcome and cleanup counters
//!
//! ## Front doors
//! - [`executor`]: The request/response service
//! - [`suggest`]: Optional remote fix suggestions for failed runs
//! - [`cli`]: The `execbox` command line

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod core;
pub mod exec;

// Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

pub mod cli;
pub mod executor;
pub mod suggest;

// Re-export commonly used types for convenience
pub use config::config::SandboxConfig;
pub use config::types::*;
pub use core::types::CancelToken;
pub use executor::{Executor, HealthReport};
pub use suggest::{Suggestion, SuggestionCache, SuggestionClient, SuggestionService};
