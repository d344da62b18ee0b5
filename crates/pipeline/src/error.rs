use sdrelay_core::error::CoreError;
use sdrelay_sdwebui::{SdWebUiError, TransportError};
use sdrelay_storage::BlobError;

use crate::imaging::ImageError;

/// Why a job ended without a result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid job: {0}")]
    Validation(#[from] CoreError),

    #[error(transparent)]
    Backend(#[from] SdWebUiError),

    #[error("Blob store: {0}")]
    Blob(#[from] BlobError),

    #[error("Image processing failed: {0}")]
    Image(#[from] ImageError),

    #[error("Upscaler returned {got} images for {expected} inputs")]
    UpscaleCardinality { expected: usize, got: usize },

    #[error("Stage {index} ({endpoint}) failed: {source}")]
    Stage {
        index: usize,
        endpoint: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Short category name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(CoreError::Internal(_)) => "internal",
            Self::Validation(_) => "validation",
            Self::Backend(SdWebUiError::Transport(TransportError::Application { .. })) => {
                "application"
            }
            Self::Backend(SdWebUiError::Transport(_)) => "transport",
            Self::Backend(SdWebUiError::Response { .. }) => "application",
            Self::Blob(BlobError::NotFound(_) | BlobError::ForeignReference(_)) => "blob_miss",
            Self::Blob(BlobError::Redis(_)) => "blob_store",
            Self::Image(_) => "image",
            Self::UpscaleCardinality { .. } => "application",
            Self::Stage { source, .. } => source.kind(),
        }
    }

    pub(crate) fn in_stage(self, index: usize, endpoint: &str) -> Self {
        Self::Stage {
            index,
            endpoint: endpoint.to_string(),
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapper_keeps_inner_kind() {
        let err =
            PipelineError::Blob(BlobError::NotFound("https://b/x".into())).in_stage(1, "img2img");
        assert_eq!(err.kind(), "blob_miss");
        assert_eq!(
            err.to_string(),
            "Stage 1 (img2img) failed: Blob store: Blob not found: https://b/x"
        );
    }

    #[test]
    fn application_errors_are_distinguished_from_transport() {
        let app = PipelineError::Backend(SdWebUiError::Transport(TransportError::Application {
            url: "u".into(),
            status: 422,
            body: "bad".into(),
        }));
        assert_eq!(app.kind(), "application");

        let exhausted = PipelineError::Backend(SdWebUiError::Transport(TransportError::Exhausted {
            url: "u".into(),
            attempts: 4,
            last_error: "500".into(),
        }));
        assert_eq!(exhausted.kind(), "transport");
    }
}
