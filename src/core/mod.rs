//! Protocol engine
//!
//! - `raft_core`: synchronous role state machine (elections, replication, commit)
//! - `raft_server`: the processing loop that owns a `RaftCore`
//! - `dispatcher`: inbound/outbound RPC plumbing for the loop
//! - `log`, `replication`, `role`, `snapshot`: the pieces `RaftCore` is built from

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod log;
pub mod raft_core;
pub mod raft_server;
pub mod replication;
pub mod role;
pub mod rpc;
pub mod snapshot;
