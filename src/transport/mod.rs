//! Transport layer for RPC communication between nodes
//!
//! - `InMemoryTransport`: channel-based transport for tests, with partitions
//! - `HttpTransport`: HTTP/JSON transport for production

pub mod http;
pub mod inmemory;
pub mod traits;

pub use traits::{Transport, TransportError};
