//! Message-bus seam and terminal callback publication.
//!
//! - [`bus`] -- the [`MessageBus`] trait the dispatcher and publisher use.
//! - [`redis_bus`] -- priority queues on Redis sorted sets.
//! - [`memory`] -- in-process bus that records acks and publishes.
//! - [`callback`] -- builds and publishes the one result message per job.

pub mod bus;
pub mod callback;
pub mod memory;
pub mod redis_bus;
pub mod topic;

pub use bus::{BusError, Delivery, MessageBus};
pub use callback::CallbackPublisher;
pub use memory::MemoryBus;
pub use redis_bus::{RedisBus, RedisBusConfig};
