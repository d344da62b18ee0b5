//! Priority queues on Redis sorted sets.
//!
//! Layout for exchange `sdrelay` and queue `sd_webui_sd15_queue`:
//!
//! ```text
//! sdrelay:sd_webui_sd15_queue            ZSET  pending messages
//! sdrelay:sd_webui_sd15_queue:inflight   ZSET  consumed, not yet acked
//! sdrelay:bindings                       HASH  routing pattern -> queue
//! ```
//!
//! A queue member is `<id>:<body>`, scored `priority * 1e13 + enqueue_ms`,
//! so lower priorities are served first and FIFO within a priority.
//!
//! A consumed member is popped and parked in the inflight set by one Lua
//! script, so a crash can leave it in either set but never in neither.
//! Blocking pops cannot run inside a script; an empty queue is polled
//! every [`EMPTY_QUEUE_BACKOFF`] until the poll window closes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sdrelay_core::types::Priority;
use tokio::time::Instant;

use crate::bus::{BusError, Delivery, MessageBus};
use crate::topic::topic_matches;

const PRIORITY_WEIGHT: f64 = 1e13;

/// Wait between pops while the queue is empty.
pub const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(100);

/// `KEYS[1]` queue, `KEYS[2]` inflight. Returns `{member, score}` or nil.
const POP_AND_PARK: &str = r#"
    local popped = redis.call('ZPOPMIN', KEYS[1])
    if #popped == 0 then
        return false
    end
    redis.call('ZADD', KEYS[2], popped[2], popped[1])
    return popped
"#;

#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    /// Key prefix shared by every queue of this exchange.
    pub exchange: String,
    /// Queue this bus consumes from.
    pub queue: String,
    /// Upper bound of one `consume` call on an empty queue.
    pub poll_timeout: Duration,
}

pub struct RedisBus {
    commands: ConnectionManager,
    pop_and_park: redis::Script,
    config: RedisBusConfig,
}

impl RedisBus {
    pub async fn connect(url: &str, config: RedisBusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client).await?;
        tracing::info!(exchange = %config.exchange, queue = %config.queue, "Connected message bus");
        Ok(Self {
            commands,
            pop_and_park: redis::Script::new(POP_AND_PARK),
            config,
        })
    }

    /// Route keys matching `pattern` to this bus's queue.
    pub async fn bind(&self, pattern: &str) -> Result<(), BusError> {
        let mut conn = self.commands.clone();
        redis::cmd("HSET")
            .arg(self.bindings_key())
            .arg(pattern)
            .arg(&self.config.queue)
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::info!(pattern, queue = %self.config.queue, "Queue bound");
        Ok(())
    }

    /// Move deliveries left unacked by a previous run back to the queue,
    /// keeping their original scores. Returns how many were moved.
    pub async fn requeue_inflight(&self) -> Result<usize, BusError> {
        let queue = self.queue_key();
        let inflight = self.inflight_key();
        let mut conn = self.commands.clone();
        let (count,): (usize,) = redis::pipe()
            .atomic()
            .cmd("ZCARD")
            .arg(&inflight)
            .cmd("ZUNIONSTORE")
            .arg(&queue)
            .arg(2)
            .arg(&queue)
            .arg(&inflight)
            .arg("AGGREGATE")
            .arg("MIN")
            .ignore()
            .cmd("DEL")
            .arg(&inflight)
            .ignore()
            .query_async(&mut conn)
            .await?;
        if count > 0 {
            tracing::warn!(count, queue = %self.config.queue, "Requeued unacknowledged deliveries");
        }
        Ok(count)
    }

    // ---- private helpers ----

    fn queue_key(&self) -> String {
        format!("{}:{}", self.config.exchange, self.config.queue)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.queue_key())
    }

    fn bindings_key(&self) -> String {
        format!("{}:bindings", self.config.exchange)
    }

    /// Queues a routing key is delivered to: every bound queue whose
    /// pattern matches, or the key itself when nothing is bound.
    async fn destinations(&self, routing_key: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.commands.clone();
        let bindings: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.bindings_key())
            .query_async(&mut conn)
            .await?;

        let mut queues: Vec<String> = bindings
            .into_iter()
            .filter(|(pattern, _)| topic_matches(pattern, routing_key))
            .map(|(_, queue)| queue)
            .collect();
        queues.sort();
        queues.dedup();
        if queues.is_empty() {
            queues.push(routing_key.to_string());
        }
        Ok(queues
            .into_iter()
            .map(|q| format!("{}:{q}", self.config.exchange))
            .collect())
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn consume(&self) -> Result<Option<Delivery>, BusError> {
        let deadline = Instant::now() + self.config.poll_timeout;
        let mut conn = self.commands.clone();
        loop {
            let popped: Option<(Vec<u8>, f64)> = self
                .pop_and_park
                .key(self.queue_key())
                .key(self.inflight_key())
                .invoke_async(&mut conn)
                .await?;
            if let Some((member, _score)) = popped {
                return decode_member(member).map(Some);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(EMPTY_QUEUE_BACKOFF.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut conn = self.commands.clone();
        redis::cmd("ZREM")
            .arg(self.inflight_key())
            .arg(&delivery.tag)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        priority: Priority,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let member = encode_member(payload);
        let score = score_for(priority, chrono::Utc::now().timestamp_millis());
        let destinations = self.destinations(routing_key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &destinations {
            pipe.cmd("ZADD").arg(key).arg(score).arg(&member).ignore();
        }
        let mut conn = self.commands.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        tracing::debug!(routing_key, priority, queues = ?destinations, "Message published");
        Ok(())
    }
}

fn score_for(priority: Priority, enqueued_ms: i64) -> f64 {
    f64::from(priority) * PRIORITY_WEIGHT + enqueued_ms.max(0) as f64
}

fn encode_member(body: &[u8]) -> Vec<u8> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let mut member = Vec::with_capacity(id.len() + 1 + body.len());
    member.extend_from_slice(id.as_bytes());
    member.push(b':');
    member.extend_from_slice(body);
    member
}

fn decode_member(member: Vec<u8>) -> Result<Delivery, BusError> {
    let split = member
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| BusError::Malformed("queue member has no id".into()))?;
    let id = std::str::from_utf8(&member[..split])
        .map_err(|_| BusError::Malformed("queue member id is not UTF-8".into()))?
        .to_string();
    let body = member[split + 1..].to_vec();
    Ok(Delivery {
        id,
        body,
        tag: member,
    })
}
