//! Response types returned by the WebUI endpoints the worker calls.
//!
//! Generation endpoints answer with either an `images` list or a single
//! `image` field, plus an `info` field that is usually a JSON-encoded
//! string carrying the per-sample seeds:
//!
//! ```text
//! {"images": ["<b64>", ...], "parameters": {...}, "info": "{\"all_seeds\": [1, 2], ...}"}
//! ```

use serde::Deserialize;
use serde_json::Value;

use sdrelay_core::types::Seed;

/// Errors raised while interpreting a 2xx response body.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("response carries no images")]
    NoImages,

    #[error("unexpected response shape: {0}")]
    Shape(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawGeneration {
    #[serde(default)]
    images: Option<Vec<String>>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    info: Option<Value>,
}

/// Images and seeds produced by one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub images: Vec<String>,
    /// Empty when the backend does not report seeds.
    pub seeds: Vec<Seed>,
}

/// Parse a generation response, keeping at most `batch_size` images.
///
/// Backends append auxiliary images (e.g. detected conditioning maps)
/// after the requested samples; truncation drops them.
pub fn parse_generation(
    body: Value,
    batch_size: Option<usize>,
) -> Result<GenerationOutput, MessageError> {
    let raw: RawGeneration = serde_json::from_value(body)?;

    let mut images = match (raw.images, raw.image) {
        (Some(images), _) if !images.is_empty() => images,
        (_, Some(image)) if !image.is_empty() => vec![image],
        _ => return Err(MessageError::NoImages),
    };
    let mut seeds = raw.info.as_ref().map(extract_seeds).unwrap_or_default();

    if let Some(limit) = batch_size {
        images.truncate(limit);
        seeds.truncate(limit);
    }

    Ok(GenerationOutput { images, seeds })
}

/// Pull `all_seeds` (or a lone `seed`) out of an `info` value that may be
/// an object or a JSON-encoded string.
fn extract_seeds(info: &Value) -> Vec<Seed> {
    let decoded;
    let info = match info {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v) => {
                decoded = v;
                &decoded
            }
            Err(_) => return Vec::new(),
        },
        other => other,
    };

    if let Some(all) = info.get("all_seeds").and_then(Value::as_array) {
        return all.iter().filter_map(Value::as_i64).collect();
    }
    info.get("seed")
        .and_then(Value::as_i64)
        .map(|s| vec![s])
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Auxiliary endpoints
// ---------------------------------------------------------------------------

/// `GET sdapi/v1/progress`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressResponse {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub state: ProgressState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressState {
    /// Jobs queued or running on the backend.
    #[serde(default)]
    pub job_count: i64,
    #[serde(default)]
    pub job: String,
}

impl ProgressResponse {
    pub fn is_idle(&self) -> bool {
        self.state.job_count <= 0
    }
}

/// `POST sdapi/v1/interrogate`.
#[derive(Debug, Clone, Deserialize)]
pub struct InterrogateResponse {
    pub caption: String,
}

/// `POST sdapi/v1/extra-batch-images/`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpscaleResponse {
    #[serde(default)]
    pub images: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
