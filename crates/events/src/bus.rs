//! Transport-agnostic message bus.
//!
//! The worker only ever needs three things from its queueing system:
//! take one message, acknowledge it once handled, and publish a message
//! under a routing key with a priority. [`MessageBus`] is exactly that.

use async_trait::async_trait;
use sdrelay_core::types::Priority;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus has been closed and holds no more messages.
    #[error("Message bus closed")]
    Closed,

    /// A stored message could not be decoded into a delivery.
    #[error("Malformed queue entry: {0}")]
    Malformed(String),

    /// The bus refused the operation (used by test doubles).
    #[error("Message bus unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// One consumed message, held until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Message id, for logs.
    pub id: String,
    pub body: Vec<u8>,
    /// Opaque handle the bus needs to acknowledge this delivery.
    pub tag: Vec<u8>,
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Take the next message.
    ///
    /// Returns `Ok(None)` when nothing arrived within the bus's poll
    /// window, so callers can check for shutdown between polls.
    async fn consume(&self) -> Result<Option<Delivery>, BusError>;

    /// Mark a delivery as terminally handled.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Publish `payload` under `routing_key`. Lower priorities are served
    /// first.
    async fn publish(
        &self,
        routing_key: &str,
        priority: Priority,
        payload: &[u8],
    ) -> Result<(), BusError>;
}
