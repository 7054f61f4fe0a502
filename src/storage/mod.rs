//! Durable storage for node state
//!
//! - `FileStorage`: one directory per node, CRC32-checked records
//! - `MemoryStorage`: in-memory storage for tests, shared between clones
//! - `SystemStore`: node identity and lifecycle record

pub mod file;
pub mod memory;
pub mod system;
mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use system::{Lifecycle, SystemRecord, SystemStore};
pub use traits::{HardState, LogStore, PersistentState, StorageError};
