//! Stage orchestration.
//!
//! [`Pipeline::run`] drives one [`Job`] through the backend:
//!
//! 1. apply `options` (model switch), if any;
//! 2. for each stage in order: resolve references, caption, thread the
//!    previous stage's first image, generate, resize;
//! 3. run the upscale sub-stage, if any, then resize to the job's
//!    output size.
//!
//! Any error aborts the whole run. Nothing is retried here; transient
//! failures are the transport's business.

use sdrelay_core::error::CoreError;
use sdrelay_core::job::{Job, UpscaleRequest};
use sdrelay_core::stage::{ImageRef, Stage};
use sdrelay_core::types::{Dimensions, Seed};
use sdrelay_sdwebui::SdWebUiApi;
use sdrelay_storage::BlobStore;

use crate::error::PipelineError;
use crate::imaging;

/// Images (inline base64) and seeds of the final stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub images: Vec<String>,
    pub seeds: Vec<Seed>,
}

/// Runs jobs against one backend. Cheap to clone; safe to share.
#[derive(Clone)]
pub struct Pipeline {
    api: SdWebUiApi,
    blobs: BlobStore,
}

impl Pipeline {
    pub fn new(api: SdWebUiApi, blobs: BlobStore) -> Self {
        Self { api, blobs }
    }

    /// Run every stage of `job`, then its upscale sub-stage.
    pub async fn run(&self, job: &Job) -> Result<PipelineOutput, PipelineError> {
        if let Some(options) = &job.options {
            self.api.set_options(options).await?;
        }

        let mut previous: Option<PipelineOutput> = None;
        for (index, stage) in job.stages.iter().enumerate() {
            let threaded = previous.as_ref().and_then(|out| out.images.first());
            let output = self
                .run_stage(index, stage.clone(), threaded.map(String::as_str))
                .await
                .map_err(|e| {
                    tracing::error!(
                        stage = index,
                        endpoint = %stage.endpoint,
                        kind = e.kind(),
                        error = %e,
                        "Stage failed",
                    );
                    e.in_stage(index, &stage.endpoint)
                })?;
            previous = Some(output);
        }

        let mut output = previous
            .ok_or_else(|| CoreError::Internal("job has no stages".into()))?;

        if let Some(upscale) = &job.upscale {
            let size = job.callback.output_size().ok_or(CoreError::MissingField(
                "callback_message.payload.gen_image_width/gen_image_height",
            ))?;
            output.images = self.upscale(upscale, &output.images, size).await?;
        }

        Ok(output)
    }

    /// Run one stage. `threaded` is the first image of the previous stage.
    async fn run_stage(
        &self,
        index: usize,
        mut stage: Stage,
        threaded: Option<&str>,
    ) -> Result<PipelineOutput, PipelineError> {
        self.resolve(stage.image_refs_mut()).await?;

        if let Some(model) = stage.interrogate_model.clone() {
            let image = stage
                .primary_seed_image()
                .and_then(ImageRef::as_inline)
                .ok_or_else(|| CoreError::Internal("captioning stage lost its seed image".into()))?
                .to_string();
            let caption = self.api.interrogate(&image, &model).await?;
            tracing::info!(
                stage = index,
                model = %model,
                caption = %caption,
                "Caption added to prompt",
            );
            stage.prepend_prompt(&caption);
        }

        if let Some(image) = threaded {
            if !stage.thread_previous_output(image) {
                tracing::debug!(
                    stage = index,
                    "Stage takes no seed image, previous output not threaded",
                );
            }
        }

        let body = stage.request_body()?;
        let generated = self
            .api
            .generate(&stage.endpoint, &body, stage.batch_size)
            .await?;

        let mut images = generated.images;
        if let Some(size) = stage.resize {
            images = imaging::resize_all(images, size).await?;
        }

        tracing::info!(
            stage = index,
            endpoint = %stage.endpoint,
            images = images.len(),
            seeds = generated.seeds.len(),
            "Stage complete",
        );
        Ok(PipelineOutput {
            images,
            seeds: generated.seeds,
        })
    }

    /// Upscale either the request's explicit image list or `images`, then
    /// resize every result to `size`.
    async fn upscale(
        &self,
        request: &UpscaleRequest,
        images: &[String],
        size: Dimensions,
    ) -> Result<Vec<String>, PipelineError> {
        let mut request = request.clone();
        self.resolve(request.image_refs_mut()).await?;

        let expected = request.image_list.as_ref().map_or(images.len(), Vec::len);
        let body = request.request_body(images)?;
        let upscaled = self.api.upscale_batch(&body).await?;
        if upscaled.len() != expected {
            return Err(PipelineError::UpscaleCardinality {
                expected,
                got: upscaled.len(),
            });
        }

        let resized = imaging::resize_all(upscaled, size).await?;
        tracing::info!(count = resized.len(), size = %size, "Upscale complete");
        Ok(resized)
    }

    /// Replace every reference in `slots` with its blob-store content.
    async fn resolve(&self, slots: Vec<&mut ImageRef>) -> Result<(), PipelineError> {
        for slot in slots {
            if let ImageRef::Reference(reference) = slot {
                let data = self.blobs.get(reference).await?;
                *slot = ImageRef::Inline(data);
            }
        }
        Ok(())
    }
}
