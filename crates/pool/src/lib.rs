//! Pending pool: durable entry store plus the admission controller.

mod pool;
mod store;

pub use pool::{PoolConfig, StatusChange, UoPool};
pub use store::{EntryStore, InMemoryStore, KeyValueStore};
