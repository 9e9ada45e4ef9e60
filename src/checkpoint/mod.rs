//! Durable per-story progress markers.
//!
//! Every stage transition writes a checkpoint before the next stage's first
//! side-effect; a restarted pipeline reads the checkpoint and jumps to the
//! earliest unfinished stage. Session checkpoints additionally record the
//! SDK session so a developer invocation can resume mid-conversation.

mod store;
mod types;

pub use store::*;
pub use types::*;
