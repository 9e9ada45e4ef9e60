//! Append-only domain event log.
//!
//! Every state-mutating decision in the orchestrator is preceded or followed
//! by an emitted event; task state is a deterministic fold over the event
//! prefix. The pipeline is restartable from the log alone, plus the
//! checkpoint store and the git working tree.

mod log;
mod state;
mod types;

pub use log::*;
pub use state::*;
pub use types::*;
