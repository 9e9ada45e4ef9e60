//! Failure classification.
//!
//! A pure decision table from failure context to a recommended recovery
//! move: retry (with backoff, more time, or immediately), salvage existing
//! git work to the judge, auto-commit and continue, or accept a terminal
//! outcome. The classifier never errors; when in doubt it recommends a
//! bounded retry and then salvage.

mod classifier;
mod types;

pub use classifier::*;
pub use types::*;
