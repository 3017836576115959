//! Language-agnostic sandbox core.
//!
//! Core owns the process model and run lifecycle: launch, supervision,
//! teardown and evidence collection.

pub mod sandbox;
pub mod supervisor;
pub mod types;
