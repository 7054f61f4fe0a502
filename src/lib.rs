//! kaukus - a replicated state machine node
//!
//! Nodes elect a leader, replicate a log of opaque commands, and apply
//! committed commands to a pluggable state machine, surviving crashes via a
//! durable log store.

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
