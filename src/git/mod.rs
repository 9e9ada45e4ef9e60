//! Git gateway: every git interaction in the orchestrator goes through here.
//!
//! Mutating and network-touching operations shell out to the `git` binary
//! with explicit timeouts and retry-with-backoff on transient failures
//! (`gateway`). Read-only inspection of the working tree and object graph
//! uses libgit2 (`inspect`). Git is the source of truth: agent claims about
//! produced work are hints that must be confirmed here.

mod gateway;
mod inspect;

pub use gateway::*;
pub use inspect::*;
