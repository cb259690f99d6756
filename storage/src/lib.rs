//! Coordination store backends.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
