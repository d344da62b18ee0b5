//! Keyed, TTL-bound storage for images kept out of message bodies.
//!
//! - [`BlobStore`] -- key generation, reference tokens, TTLs and the
//!   per-job tracking set.
//! - [`BlobBackend`] -- the storage seam, implemented by
//!   [`RedisBackend`] for production and [`MemoryBackend`] for tests.

pub mod backend;
pub mod memory;
pub mod redis_backend;
pub mod store;

pub use backend::{BlobBackend, BlobError};
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use store::{BlobStore, BlobStoreConfig};
