//! Typed wrappers for the WebUI endpoints used by the pipeline.
//!
//! Every call goes through [`ResilientClient`], so transient network
//! failures are absorbed before they reach the pipeline.

use serde_json::{Map, Value};

use crate::messages::{
    parse_generation, GenerationOutput, InterrogateResponse, MessageError, ProgressResponse,
    UpscaleResponse,
};
use crate::transport::{CallKind, ResilientClient, TransportError};

/// Model/setting switch.
pub const OPTIONS_ENDPOINT: &str = "sdapi/v1/options/";
/// Batch upscaling of named images.
pub const BATCH_UPSCALE_ENDPOINT: &str = "sdapi/v1/extra-batch-images/";
/// Image captioning.
pub const INTERROGATE_ENDPOINT: &str = "sdapi/v1/interrogate";
/// Queue/progress status, used for readiness.
pub const PROGRESS_ENDPOINT: &str = "sdapi/v1/progress?skip_current_image=true";

/// Errors from the WebUI API layer.
#[derive(Debug, thiserror::Error)]
pub enum SdWebUiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A 2xx response whose body could not be interpreted.
    #[error("Unexpected response from {endpoint}: {source}")]
    Response {
        endpoint: String,
        #[source]
        source: MessageError,
    },
}

/// Client for a single WebUI instance.
#[derive(Debug, Clone)]
pub struct SdWebUiApi {
    transport: ResilientClient,
}

impl SdWebUiApi {
    pub fn new(transport: ResilientClient) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &ResilientClient {
        &self.transport
    }

    /// Apply backend options (e.g. switch the loaded checkpoint).
    ///
    /// Synchronous on the backend side: returns once the switch is done.
    pub async fn set_options(&self, options: &Map<String, Value>) -> Result<(), SdWebUiError> {
        self.transport
            .post_json(OPTIONS_ENDPOINT, &Value::Object(options.clone()), CallKind::Post)
            .await?;
        tracing::info!(keys = options.len(), "Backend options applied");
        Ok(())
    }

    /// Run one generation request and parse its images and seeds.
    pub async fn generate(
        &self,
        endpoint: &str,
        body: &Value,
        batch_size: Option<usize>,
    ) -> Result<GenerationOutput, SdWebUiError> {
        tracing::info!(url = %self.transport.url(endpoint), "Posting generation request");
        let response = self
            .transport
            .post_json(endpoint, body, CallKind::Post)
            .await?;
        parse_generation(response, batch_size).map_err(|source| SdWebUiError::Response {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    /// Caption `image` (inline base64) with the named model.
    pub async fn interrogate(&self, image: &str, model: &str) -> Result<String, SdWebUiError> {
        let body = serde_json::json!({ "image": image, "model": model });
        let response = self
            .transport
            .post_json(INTERROGATE_ENDPOINT, &body, CallKind::Post)
            .await?;
        let parsed: InterrogateResponse =
            serde_json::from_value(response).map_err(|e| SdWebUiError::Response {
                endpoint: INTERROGATE_ENDPOINT.to_string(),
                source: e.into(),
            })?;
        Ok(parsed.caption)
    }

    /// Upscale a batch of named images.
    pub async fn upscale_batch(&self, body: &Value) -> Result<Vec<String>, SdWebUiError> {
        let response = self
            .transport
            .post_json(BATCH_UPSCALE_ENDPOINT, body, CallKind::Post)
            .await?;
        let parsed: UpscaleResponse =
            serde_json::from_value(response).map_err(|e| SdWebUiError::Response {
                endpoint: BATCH_UPSCALE_ENDPOINT.to_string(),
                source: e.into(),
            })?;
        Ok(parsed.images)
    }

    /// Current queue state of the backend.
    pub async fn progress(&self) -> Result<ProgressResponse, SdWebUiError> {
        let response = self
            .transport
            .get_json(PROGRESS_ENDPOINT, CallKind::Check)
            .await?;
        serde_json::from_value(response).map_err(|e| SdWebUiError::Response {
            endpoint: PROGRESS_ENDPOINT.to_string(),
            source: e.into(),
        })
    }
}
