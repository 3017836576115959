//! Evidence-backed verdict classification
//!
//! Derives verdicts as pure functions over immutable evidence bundles.

pub mod result;
pub mod verdict;

pub use result::execution_result;
pub use verdict::{Verdict, VerdictCause, VerdictClassifier};
