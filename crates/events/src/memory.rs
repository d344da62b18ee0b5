//! In-process [`MessageBus`] for tests and local runs.
//!
//! Messages are served FIFO. Every ack and publish is recorded so tests
//! can assert on exactly what the worker did.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sdrelay_core::types::Priority;
use tokio::sync::Notify;

use crate::bus::{BusError, Delivery, MessageBus};

/// How long [`MemoryBus::consume`] waits for a message before returning `None`.
const POLL_WINDOW: Duration = Duration::from_millis(100);

/// A message recorded by [`MemoryBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub routing_key: String,
    pub priority: Priority,
    pub payload: Vec<u8>,
}

impl Published {
    /// The payload parsed as JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<Delivery>,
    closed: bool,
    acked: Vec<String>,
    published: Vec<Published>,
    failing_publishes: usize,
}

#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body and return its id.
    pub fn push(&self, body: impl Into<Vec<u8>>) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let delivery = Delivery {
            tag: id.clone().into_bytes(),
            id: id.clone(),
            body: body.into(),
        };
        self.lock().queue.push_back(delivery);
        self.notify.notify_one();
        id
    }

    /// Stop accepting work: once drained, `consume` fails with
    /// [`BusError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failing_publishes = count;
    }

    /// Ids of acknowledged deliveries, in ack order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Messages still waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn consume(&self) -> Result<Option<Delivery>, BusError> {
        let notified = self.notify.notified();
        {
            let mut state = self.lock();
            if let Some(delivery) = state.queue.pop_front() {
                return Ok(Some(delivery));
            }
            if state.closed {
                return Err(BusError::Closed);
            }
        }
        let _ = tokio::time::timeout(POLL_WINDOW, notified).await;
        Ok(self.lock().queue.pop_front())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        self.lock().acked.push(delivery.id.clone());
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        priority: Priority,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BusError::Unavailable("injected publish failure".into()));
        }
        state.published.push(Published {
            routing_key: routing_key.to_string(),
            priority,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn serves_fifo_then_reports_closed() {
        let bus = MemoryBus::new();
        let first = bus.push("one");
        let second = bus.push("two");
        bus.close();

        assert_eq!(bus.consume().await.unwrap().unwrap().id, first);
        assert_eq!(bus.consume().await.unwrap().unwrap().id, second);
        assert_matches!(bus.consume().await, Err(BusError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_open_bus_times_out_with_none() {
        let bus = MemoryBus::new();
        assert!(bus.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_not_recorded() {
        let bus = MemoryBus::new();
        bus.fail_next_publishes(1);
        assert_matches!(bus.publish("k", 1, b"{}").await, Err(BusError::Unavailable(_)));
        bus.publish("k", 1, b"{}").await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }
}
