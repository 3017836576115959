//! Execution control
//!
//! The pre-exec chain the child walks between fork and exec, with type-state enforcement.

pub mod preexec;
