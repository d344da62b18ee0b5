//! Terminal callback publication.
//!
//! [`CallbackPublisher`] turns a job's [`JobOutcome`] into exactly one
//! outbound message: the caller's `callback_payload` with the result
//! fields merged in. Failed publishes are retried on a fixed schedule
//! (1 s, 2 s, 4 s) with the same bytes each time.

use std::sync::Arc;
use std::time::Duration;

use sdrelay_core::job::CallbackTarget;
use sdrelay_core::outcome::JobOutcome;
use serde_json::{Map, Value};

use crate::bus::{BusError, MessageBus};

/// Retry delays in seconds (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// Result image references, or null on failure.
pub const RESULT_IMAGES_FIELD: &str = "result_images";
/// Per-image seeds, or null on failure.
pub const ALL_SEEDS_FIELD: &str = "all_seeds";
/// Every reference tracked for the job so far.
pub const TRACKED_IMAGES_FIELD: &str = "tracked_images";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Build the callback payload for `outcome`.
///
/// Caller-supplied fields are preserved except the result fields, which
/// are always overwritten. `tracked` is omitted when the job has no
/// tracking set.
pub fn build_payload(
    target: &CallbackTarget,
    outcome: &JobOutcome,
    tracked: Option<&[String]>,
) -> Map<String, Value> {
    let mut payload = target.payload.clone();
    let (images, seeds) = match outcome {
        JobOutcome::Success(result) => (
            Value::from(result.image_refs.clone()),
            Value::from(result.seeds.clone()),
        ),
        JobOutcome::Failure { .. } => (Value::Null, Value::Null),
    };
    payload.insert(RESULT_IMAGES_FIELD.into(), images);
    payload.insert(ALL_SEEDS_FIELD.into(), seeds);
    if let Some(tracked) = tracked {
        payload.insert(TRACKED_IMAGES_FIELD.into(), Value::from(tracked.to_vec()));
    }
    payload
}

// ---------------------------------------------------------------------------
// CallbackPublisher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CallbackPublisher {
    bus: Arc<dyn MessageBus>,
    retry_delays: Vec<Duration>,
}

impl CallbackPublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            retry_delays: RETRY_DELAYS_SECS.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Override the retry schedule.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Publish the terminal message for a job.
    ///
    /// Tries once, then once more after each retry delay. Returns the
    /// first error if every attempt fails.
    pub async fn publish(
        &self,
        target: &CallbackTarget,
        outcome: &JobOutcome,
        tracked: Option<&[String]>,
    ) -> Result<(), BusError> {
        let payload = build_payload(target, outcome, tracked);
        let body = serde_json::to_vec(&Value::Object(payload))
            .map_err(|e| BusError::Malformed(e.to_string()))?;

        let mut first_err: Option<BusError> = None;
        let attempts = self.retry_delays.len() + 1;

        for attempt in 1..=attempts {
            match self
                .bus
                .publish(&target.routing_key, target.priority, &body)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        routing_key = %target.routing_key,
                        priority = target.priority,
                        success = outcome.is_success(),
                        attempt,
                        "Published callback",
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        routing_key = %target.routing_key,
                        attempt,
                        error = %e,
                        "Callback publish attempt failed",
                    );
                    first_err.get_or_insert(e);
                }
            }
            if let Some(delay) = self.retry_delays.get(attempt - 1) {
                tokio::time::sleep(*delay).await;
            }
        }

        tracing::error!(
            routing_key = %target.routing_key,
            attempts,
            "Callback publish failed after all retries",
        );
        Err(first_err.unwrap_or(BusError::Unavailable("no publish attempt made".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
