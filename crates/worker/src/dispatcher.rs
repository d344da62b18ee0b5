//! Bounded delivery dispatcher.
//!
//! Pulls deliveries from the bus one at a time and runs each in its own
//! task. A semaphore permit is taken *before* consuming, so at most
//! `concurrency` deliveries are ever held by this worker, and messages
//! beyond that stay on the bus for other workers.
//!
//! A delivery is acknowledged only after its handler finished, whether
//! it succeeded, failed, or panicked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sdrelay_events::{BusError, MessageBus};
use sdrelay_pipeline::{JobProcessor, ProcessReport};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pause after a failed consume before polling again.
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Work done for one delivery body.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, body: &[u8]);
}

#[async_trait]
impl DeliveryHandler for JobProcessor {
    async fn handle(&self, body: &[u8]) {
        match self.process(body).await {
            ProcessReport::Answered { outcome, published } => {
                tracing::debug!(success = outcome.is_success(), published, "Delivery handled");
            }
            ProcessReport::Unanswerable { .. } => {}
        }
    }
}

pub struct Dispatcher<H> {
    bus: Arc<dyn MessageBus>,
    handler: Arc<H>,
    concurrency: usize,
}

impl<H: DeliveryHandler> Dispatcher<H> {
    pub fn new(bus: Arc<dyn MessageBus>, handler: Arc<H>, concurrency: usize) -> Self {
        Self {
            bus,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    /// Run until `cancel` fires or the bus closes, then wait for every
    /// in-flight delivery to finish and be acknowledged.
    pub async fn run(&self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        tracing::info!(concurrency = self.concurrency, "Dispatcher started");

        loop {
            while let Some(finished) = tasks.try_join_next() {
                log_join(finished);
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if cancel.is_cancelled() {
                break;
            }

            // Must not be dropped mid-call; the bus bounds each poll.
            let delivery = match self.bus.consume().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(BusError::Closed) => {
                    tracing::info!("Message bus closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to consume from message bus");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CONSUME_ERROR_BACKOFF) => continue,
                    }
                }
            };

            tracing::info!(delivery_id = %delivery.id, "Delivery received");
            let bus = Arc::clone(&self.bus);
            let handler = Arc::clone(&self.handler);
            tasks.spawn(async move {
                let _permit = permit;
                let body = delivery.body.clone();
                let handled = tokio::spawn(async move { handler.handle(&body).await }).await;
                if let Err(e) = handled {
                    tracing::error!(
                        delivery_id = %delivery.id,
                        error = %e,
                        "Delivery handler panicked",
                    );
                }
                match bus.ack(&delivery).await {
                    Ok(()) => tracing::info!(delivery_id = %delivery.id, "Delivery acknowledged"),
                    Err(e) => tracing::error!(
                        delivery_id = %delivery.id,
                        error = %e,
                        "Failed to acknowledge delivery",
                    ),
                }
            });
        }

        tracing::info!(in_flight = tasks.len(), "Dispatcher draining");
        while let Some(finished) = tasks.join_next().await {
            log_join(finished);
        }
        tracing::info!("Dispatcher stopped");
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Dispatch task failed");
    }
}
