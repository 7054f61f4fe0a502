//! State machine layer
//!
//! - `KeyValueStore`: Simple key-value store
//! - `TestStateMachine`: Records commands for testing

pub mod kv;
pub mod traits;

pub use kv::{KeyValueStore, SharedKvStore};
pub use traits::{AppliedCommands, ApplyResult, Snapshotable, StateMachine, TestStateMachine};
