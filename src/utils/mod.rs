//! Utilities
//!
//! Cross-cutting utilities for environment hygiene and output collection.

pub mod env_hygiene;
pub mod output;
