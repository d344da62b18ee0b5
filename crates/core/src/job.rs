//! Inbound job messages and their validation.
//!
//! A job message has the shape:
//!
//! ```text
//! {
//!   "callback_message": {"routing_key": "...", "payload": {...}, "callback_priority": 255},
//!   "requests": [{"endpoint": "...", "payload": {...}, "interrogate_model": "..."}],
//!   "sd_webui_options_payload": {...},      // optional
//!   "upscale_payload": {...}                // optional
//! }
//! ```
//!
//! The single-request form (`endpoint` + `payload` at top level) is also
//! accepted and treated as a one-stage job.
//!
//! Intake happens in two steps. [`CallbackTarget::from_message`] extracts
//! where the terminal result must go; once that succeeds every later
//! failure can still be answered. [`Job::from_message`] then validates the
//! rest of the message into typed [`Stage`]s.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::stage::{json_kind, ImageRef, Stage};
use crate::types::{Dimensions, Priority, DEFAULT_CALLBACK_PRIORITY, MAX_IMAGE_SIDE};

// ---------------------------------------------------------------------------
// Callback target
// ---------------------------------------------------------------------------

/// Where and how the terminal result of a job is published.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackTarget {
    pub routing_key: String,
    /// Caller-supplied payload, echoed back with the result fields merged in.
    pub payload: Map<String, Value>,
    pub priority: Priority,
}

impl CallbackTarget {
    /// Read `callback_message` from an inbound message.
    pub fn from_message(message: &Value) -> Result<Self, CoreError> {
        let callback = message
            .get("callback_message")
            .and_then(Value::as_object)
            .ok_or(CoreError::MissingField("callback_message"))?;

        let routing_key = callback
            .get("routing_key")
            .and_then(Value::as_str)
            .filter(|k| !k.trim().is_empty())
            .ok_or(CoreError::MissingField("callback_message.routing_key"))?
            .to_string();

        let payload = callback
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .ok_or(CoreError::MissingField("callback_message.payload"))?;

        let priority = match callback.get("callback_priority") {
            None | Some(Value::Null) => DEFAULT_CALLBACK_PRIORITY,
            Some(v) => v
                .as_u64()
                .and_then(|p| Priority::try_from(p).ok())
                .ok_or_else(|| {
                    CoreError::Validation(format!("callback_priority must be 0-255, got {v}"))
                })?,
        };

        Ok(Self {
            routing_key,
            payload,
            priority,
        })
    }

    /// Key of the job's tracking set, from `payload.job_id`.
    pub fn job_id(&self) -> Option<String> {
        match self.payload.get("job_id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Requested final output size, from `payload.gen_image_width/height`.
    ///
    /// `None` unless both sides are within `1..=MAX_IMAGE_SIDE`.
    pub fn output_size(&self) -> Option<Dimensions> {
        Some(Dimensions::new(
            Dimensions::side(self.payload.get("gen_image_width"))?,
            Dimensions::side(self.payload.get("gen_image_height"))?,
        ))
    }
}

// ---------------------------------------------------------------------------
// Upscale request
// ---------------------------------------------------------------------------

/// An entry of the batch-upscale `imageList`.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedImage {
    pub name: String,
    pub data: ImageRef,
}

/// Parameters of the optional upscale sub-stage.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleRequest {
    /// Upscaler parameters with `imageList` removed.
    pub params: Map<String, Value>,
    /// Explicit images to upscale; `None` means the pipeline's own result.
    pub image_list: Option<Vec<NamedImage>>,
}

impl UpscaleRequest {
    pub fn from_payload(mut params: Map<String, Value>) -> Result<Self, CoreError> {
        let image_list = match params.remove("imageList") {
            None | Some(Value::Null) => None,
            Some(Value::Array(entries)) => Some(
                entries
                    .into_iter()
                    .enumerate()
                    .map(|(index, entry)| parse_named_image(index, entry))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(other) => {
                return Err(CoreError::Validation(format!(
                    "upscale_payload.imageList must be a list, got {}",
                    json_kind(&other)
                )))
            }
        };
        Ok(Self { params, image_list })
    }

    /// Every image-bearing slot, for in-place resolution.
    pub fn image_refs_mut(&mut self) -> Vec<&mut ImageRef> {
        self.image_list
            .iter_mut()
            .flatten()
            .map(|entry| &mut entry.data)
            .collect()
    }

    /// Render the batch-upscale body. Without an explicit list, the
    /// `fallback` images are named positionally `image_{index}`.
    pub fn request_body(&self, fallback: &[String]) -> Result<Value, CoreError> {
        let entries = match &self.image_list {
            Some(list) => list
                .iter()
                .map(|entry| {
                    let data = entry.data.as_inline().ok_or_else(|| {
                        CoreError::Internal(format!(
                            "upscale image '{}' still holds a reference",
                            entry.name
                        ))
                    })?;
                    Ok(named_entry(&entry.name, data))
                })
                .collect::<Result<Vec<_>, CoreError>>()?,
            None => fallback
                .iter()
                .enumerate()
                .map(|(index, data)| named_entry(&format!("image_{index}"), data))
                .collect(),
        };

        let mut body = self.params.clone();
        body.insert("imageList".into(), Value::Array(entries));
        Ok(Value::Object(body))
    }
}

fn named_entry(name: &str, data: &str) -> Value {
    serde_json::json!({ "name": name, "data": data })
}

fn parse_named_image(index: usize, entry: Value) -> Result<NamedImage, CoreError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("image_{index}"));
    let data = entry
        .get("data")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| {
            CoreError::Validation(format!("upscale_payload.imageList[{index}].data is missing"))
        })?;
    Ok(NamedImage {
        name,
        data: ImageRef::from_raw(data),
    })
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default)]
    requests: Option<Vec<RawStage>>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    #[serde(default)]
    sd_webui_options_payload: Option<Map<String, Value>>,
    #[serde(default)]
    upscale_payload: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    endpoint: String,
    payload: Map<String, Value>,
    #[serde(default)]
    interrogate_model: Option<String>,
}

/// A validated generation job. Owned by exactly one worker task.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub callback: CallbackTarget,
    /// Non-empty, executed strictly in order.
    pub stages: Vec<Stage>,
    /// Backend settings switch applied before the first stage.
    pub options: Option<Map<String, Value>>,
    pub upscale: Option<UpscaleRequest>,
}

impl Job {
    /// Validate the non-callback part of an inbound message.
    pub fn from_message(message: &Value, callback: CallbackTarget) -> Result<Self, CoreError> {
        let raw: RawJob = serde_json::from_value(message.clone())
            .map_err(|e| CoreError::Validation(format!("malformed job message: {e}")))?;

        let raw_stages = match (raw.requests, raw.endpoint, raw.payload) {
            (Some(requests), _, _) => requests,
            (None, Some(endpoint), Some(payload)) => vec![RawStage {
                endpoint,
                payload,
                interrogate_model: None,
            }],
            (None, _, _) => return Err(CoreError::MissingField("requests")),
        };

        if raw_stages.is_empty() {
            return Err(CoreError::Validation("requests must not be empty".into()));
        }

        let stages = raw_stages
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                Stage::from_parts(raw.endpoint, raw.payload, raw.interrogate_model).map_err(
                    |e| match e {
                        CoreError::Validation(msg) => {
                            CoreError::Validation(format!("requests[{index}]: {msg}"))
                        }
                        other => other,
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let upscale = raw
            .upscale_payload
            .map(UpscaleRequest::from_payload)
            .transpose()?;

        if upscale.is_some() && callback.output_size().is_none() {
            return Err(CoreError::Validation(format!(
                "upscale_payload requires gen_image_width and gen_image_height \
                 between 1 and {MAX_IMAGE_SIDE} in the callback payload"
            )));
        }

        Ok(Self {
            callback,
            stages,
            options: raw.sd_webui_options_payload,
            upscale,
        })
    }

    pub fn job_id(&self) -> Option<String> {
        self.callback.job_id()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
