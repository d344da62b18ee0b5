//! Job execution: the stage orchestrator, the upscale sub-stage, the
//! image resize codec, and the per-message [`JobProcessor`] that ties
//! them to the blob store and the callback publisher.

pub mod error;
pub mod imaging;
pub mod orchestrator;
pub mod processor;

pub use error::PipelineError;
pub use orchestrator::{Pipeline, PipelineOutput};
pub use processor::{JobProcessor, ProcessReport};
