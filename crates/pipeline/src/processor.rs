//! Per-message job processing.
//!
//! [`JobProcessor::process`] is the unit the dispatcher runs for each
//! delivery. Once the callback target has been read, every path ends in
//! exactly one call to the callback publisher:
//!
//! ```text
//! body -> callback target -> [ validate -> run -> store images -> track ] -> publish
//!                                 \______________ JobOutcome ____________/
//! ```
//!
//! The bracketed part runs in its own task, so a panic inside it still
//! produces a failure outcome and a callback.

use futures::future::try_join_all;
use sdrelay_core::job::{CallbackTarget, Job};
use sdrelay_core::outcome::{JobOutcome, JobResult};
use sdrelay_core::sanitize::sanitize_for_log;
use sdrelay_events::CallbackPublisher;
use sdrelay_storage::BlobStore;
use serde_json::Value;

use crate::error::PipelineError;
use crate::orchestrator::Pipeline;

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessReport {
    /// The message named no usable callback target; nothing was published.
    Unanswerable { reason: String },
    /// The job ran to an outcome and its callback was attempted.
    Answered {
        outcome: JobOutcome,
        /// Whether the callback publish succeeded.
        published: bool,
    },
}

/// Validates, runs, and answers jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobProcessor {
    pipeline: Pipeline,
    blobs: BlobStore,
    publisher: CallbackPublisher,
}

impl JobProcessor {
    pub fn new(pipeline: Pipeline, blobs: BlobStore, publisher: CallbackPublisher) -> Self {
        Self {
            pipeline,
            blobs,
            publisher,
        }
    }

    /// Process one raw message body.
    pub async fn process(&self, body: &[u8]) -> ProcessReport {
        let message: Value = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(e) => return unanswerable(format!("message is not JSON: {e}")),
        };
        tracing::info!(message = %sanitize_for_log(&message), "Received job");

        let target = match CallbackTarget::from_message(&message) {
            Ok(target) => target,
            Err(e) => return unanswerable(e.to_string()),
        };
        let job_id = target.job_id();

        let task = {
            let this = self.clone();
            let target = target.clone();
            tokio::spawn(async move { this.execute(&message, &target).await })
        };
        let (outcome, tracked) = match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = ?job_id, error = %e, "Job task panicked");
                let tracked = self.current_tracking(job_id.as_deref()).await;
                (JobOutcome::failure(format!("job task panicked: {e}")), tracked)
            }
        };

        let published = match self
            .publisher
            .publish(&target, &outcome, tracked.as_deref())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(job_id = ?job_id, error = %e, "Callback was not delivered");
                false
            }
        };

        ProcessReport::Answered { outcome, published }
    }

    // ---- private helpers ----

    /// Run the job to an outcome plus the job's tracking set.
    async fn execute(
        &self,
        message: &Value,
        target: &CallbackTarget,
    ) -> (JobOutcome, Option<Vec<String>>) {
        let job_id = target.job_id();
        match self.try_execute(message, target).await {
            Ok((result, tracked)) => {
                tracing::info!(
                    job_id = ?job_id,
                    images = result.image_refs.len(),
                    "Job succeeded",
                );
                (JobOutcome::Success(result), tracked)
            }
            Err(e) => {
                tracing::error!(job_id = ?job_id, kind = e.kind(), error = %e, "Job failed");
                let tracked = self.current_tracking(job_id.as_deref()).await;
                (JobOutcome::failure(&e), tracked)
            }
        }
    }

    async fn try_execute(
        &self,
        message: &Value,
        target: &CallbackTarget,
    ) -> Result<(JobResult, Option<Vec<String>>), PipelineError> {
        let job = Job::from_message(message, target.clone())?;
        let output = self.pipeline.run(&job).await?;

        let image_refs =
            try_join_all(output.images.iter().map(|image| self.blobs.put(image))).await?;

        let tracked = match job.job_id() {
            Some(job_id) => Some(self.blobs.track(&job_id, &image_refs).await?),
            None => None,
        };

        Ok((
            JobResult {
                image_refs,
                seeds: output.seeds,
            },
            tracked,
        ))
    }

    /// Best-effort read of a job's tracking set for a failure callback.
    async fn current_tracking(&self, job_id: Option<&str>) -> Option<Vec<String>> {
        let job_id = job_id?;
        match self.blobs.tracked(job_id).await {
            Ok(tracked) => Some(tracked),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Could not read tracking set");
                None
            }
        }
    }
}

fn unanswerable(reason: String) -> ProcessReport {
    tracing::error!(reason = %reason, "Dropping message without a callback target");
    ProcessReport::Unanswerable { reason }
}
