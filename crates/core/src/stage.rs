//! Typed generation stages.
//!
//! A stage is one backend call within a job. Its payload is mostly
//! opaque pass-through JSON, but the image-bearing fields are lifted out
//! at intake into typed slots so the pipeline knows, per [`StageKind`],
//! whether a stage can be seeded from a previous stage's output.
//!
//! Recognised image-bearing fields of a stage payload:
//!
//! ```text
//! init_images                          -> SeedInputs::init_images
//! mask                                 -> SeedInputs::mask
//! alwayson_scripts.controlnet.args[i]  -> ConditioningUnit (input_image lifted out)
//! resize_payload                       -> Stage::resize (never sent to the backend)
//! ```
//!
//! An `img2img` endpoint always has a seed slot, even when its payload
//! names no `init_images`, so a chained stage can be fed the previous
//! stage's output.

use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::{Dimensions, MAX_IMAGE_SIDE};

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// An image carried in a message: inline base64 data or a reference
/// token resolvable through the blob store.
///
/// References are URL-shaped (`http://` / `https://`). The base64
/// alphabet never contains `:`, so classification needs no context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Inline(String),
    Reference(String),
}

impl ImageRef {
    /// Classify a raw string taken from a message body.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Reference(raw)
        } else {
            Self::Inline(raw)
        }
    }

    /// The inline base64 data, or `None` while still a reference.
    pub fn as_inline(&self) -> Option<&str> {
        match self {
            Self::Inline(data) => Some(data),
            Self::Reference(_) => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    fn to_inline_value(&self, field: &str) -> Result<Value, CoreError> {
        self.as_inline()
            .map(|data| Value::String(data.to_string()))
            .ok_or_else(|| {
                CoreError::Internal(format!("image field '{field}' still holds a reference"))
            })
    }
}

// ---------------------------------------------------------------------------
// Stage kinds
// ---------------------------------------------------------------------------

/// Seed inputs of an image-to-image stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedInputs {
    pub init_images: Vec<ImageRef>,
    pub mask: Option<ImageRef>,
}

/// One auxiliary conditioning unit (e.g. an edge or depth guide).
///
/// `args` holds the unit's remaining backend parameters untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningUnit {
    pub input_image: Option<ImageRef>,
    pub args: Map<String, Value>,
}

/// What a stage accepts as image input.
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    /// Text-only generation. Has no seed-image slot.
    Text,
    /// Generation seeded from one or more images.
    Seeded(SeedInputs),
    /// Generation guided by conditioning units, optionally also seeded.
    Conditioned {
        seed: Option<SeedInputs>,
        units: Vec<ConditioningUnit>,
    },
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One backend request within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Backend-relative endpoint, e.g. `sdapi/v1/img2img`.
    pub endpoint: String,
    pub kind: StageKind,
    /// Pass-through parameters with the image-bearing fields removed.
    pub payload: Map<String, Value>,
    /// Captioning model to run on the primary seed image first.
    pub interrogate_model: Option<String>,
    /// Inter-stage normalisation size applied to this stage's output.
    pub resize: Option<Dimensions>,
    /// Number of output images to keep.
    pub batch_size: Option<usize>,
}

impl Stage {
    /// Build a stage from its endpoint and raw payload, lifting every
    /// image-bearing field into a typed slot.
    pub fn from_parts(
        endpoint: String,
        mut payload: Map<String, Value>,
        interrogate_model: Option<String>,
    ) -> Result<Self, CoreError> {
        if endpoint.trim().is_empty() {
            return Err(CoreError::Validation("stage endpoint must not be empty".into()));
        }

        let resize = payload
            .remove("resize_payload")
            .filter(|v| !v.is_null())
            .map(|v| parse_resize(&v))
            .transpose()?;

        let batch_size = match payload.get("batch_size") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(n) if n > 0 => Some(n as usize),
                _ => {
                    return Err(CoreError::Validation(format!(
                        "batch_size must be a positive integer, got {v}"
                    )))
                }
            },
        };

        let init_images = payload
            .remove("init_images")
            .filter(|v| !v.is_null())
            .map(|v| parse_image_list(v, "init_images"))
            .transpose()?;
        let mask = payload
            .remove("mask")
            .filter(|v| !v.is_null())
            .map(|v| parse_image(v, "mask"))
            .transpose()?;
        let units = take_conditioning_units(&mut payload)?;

        let seed = match (init_images, mask) {
            (None, None) if is_image_to_image(&endpoint) => Some(SeedInputs {
                init_images: Vec::new(),
                mask: None,
            }),
            (None, None) => None,
            (init_images, mask) => Some(SeedInputs {
                init_images: init_images.unwrap_or_default(),
                mask,
            }),
        };

        let kind = match (seed, units) {
            (seed, Some(units)) => StageKind::Conditioned { seed, units },
            (Some(seed), None) => StageKind::Seeded(seed),
            (None, None) => StageKind::Text,
        };

        let stage = Self {
            endpoint,
            kind,
            payload,
            interrogate_model: interrogate_model.filter(|m| !m.trim().is_empty()),
            resize,
            batch_size,
        };

        if stage.interrogate_model.is_some() && stage.primary_seed_image().is_none() {
            return Err(CoreError::Validation(format!(
                "stage '{}' requests captioning but declares no seed image",
                stage.endpoint
            )));
        }

        Ok(stage)
    }

    /// Seed inputs of this stage, if its kind has any.
    pub fn seed(&self) -> Option<&SeedInputs> {
        match &self.kind {
            StageKind::Text => None,
            StageKind::Seeded(seed) => Some(seed),
            StageKind::Conditioned { seed, .. } => seed.as_ref(),
        }
    }

    /// First declared seed image, used for captioning.
    pub fn primary_seed_image(&self) -> Option<&ImageRef> {
        self.seed().and_then(|s| s.init_images.first())
    }

    /// Every image-bearing slot of this stage, for in-place resolution.
    pub fn image_refs_mut(&mut self) -> Vec<&mut ImageRef> {
        let mut refs = Vec::new();
        let (seed, units) = match &mut self.kind {
            StageKind::Text => (None, None),
            StageKind::Seeded(seed) => (Some(seed), None),
            StageKind::Conditioned { seed, units } => (seed.as_mut(), Some(units)),
        };
        if let Some(seed) = seed {
            refs.extend(seed.init_images.iter_mut());
            refs.extend(seed.mask.iter_mut());
        }
        if let Some(units) = units {
            refs.extend(units.iter_mut().filter_map(|u| u.input_image.as_mut()));
        }
        refs
    }

    /// Replace the seed image and every conditioning image with `image`,
    /// the first output of the previous stage.
    ///
    /// Returns `false` for kinds with no image slot; the stage is left
    /// untouched in that case.
    pub fn thread_previous_output(&mut self, image: &str) -> bool {
        let threaded = ImageRef::Inline(image.to_string());
        match &mut self.kind {
            StageKind::Text => false,
            StageKind::Seeded(seed) => {
                seed.init_images = vec![threaded];
                true
            }
            StageKind::Conditioned { seed, units } => {
                if let Some(seed) = seed {
                    seed.init_images = vec![threaded.clone()];
                }
                for unit in units.iter_mut() {
                    unit.input_image = Some(threaded.clone());
                }
                true
            }
        }
    }

    /// Prepend a caption to the stage's `prompt` field.
    pub fn prepend_prompt(&mut self, caption: &str) {
        let caption = caption.trim();
        if caption.is_empty() {
            return;
        }
        let prompt = match self.payload.get("prompt").and_then(Value::as_str) {
            Some(existing) if !existing.trim().is_empty() => format!("{caption}, {existing}"),
            _ => caption.to_string(),
        };
        self.payload.insert("prompt".into(), Value::String(prompt));
    }

    /// Render the JSON body sent to the backend.
    ///
    /// Fails if any image slot still holds a reference token.
    pub fn request_body(&self) -> Result<Value, CoreError> {
        let mut body = self.payload.clone();

        if let Some(seed) = self.seed() {
            let images = seed
                .init_images
                .iter()
                .map(|r| r.to_inline_value("init_images"))
                .collect::<Result<Vec<_>, _>>()?;
            body.insert("init_images".into(), Value::Array(images));
            if let Some(mask) = &seed.mask {
                body.insert("mask".into(), mask.to_inline_value("mask")?);
            }
        }

        if let StageKind::Conditioned { units, .. } = &self.kind {
            let args = units
                .iter()
                .map(|unit| {
                    let mut args = unit.args.clone();
                    if let Some(image) = &unit.input_image {
                        args.insert("input_image".into(), image.to_inline_value("input_image")?);
                    }
                    Ok(Value::Object(args))
                })
                .collect::<Result<Vec<_>, CoreError>>()?;

            let scripts = body
                .entry("alwayson_scripts")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(scripts) = scripts {
                let controlnet = scripts
                    .entry("controlnet")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(controlnet) = controlnet {
                    controlnet.insert("args".into(), Value::Array(args));
                }
            }
        }

        Ok(Value::Object(body))
    }
}

// ---------------------------------------------------------------------------
// Field parsing helpers
// ---------------------------------------------------------------------------

/// Whether `endpoint` takes seed images regardless of its payload.
fn is_image_to_image(endpoint: &str) -> bool {
    endpoint.trim().trim_end_matches('/').ends_with("img2img")
}

fn parse_image(value: Value, field: &str) -> Result<ImageRef, CoreError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(ImageRef::from_raw(s)),
        other => Err(CoreError::Validation(format!(
            "'{field}' must be a non-empty string, got {}",
            json_kind(&other)
        ))),
    }
}

fn parse_image_list(value: Value, field: &str) -> Result<Vec<ImageRef>, CoreError> {
    match value {
        Value::Array(items) => items.into_iter().map(|v| parse_image(v, field)).collect(),
        other => Err(CoreError::Validation(format!(
            "'{field}' must be a list of images, got {}",
            json_kind(&other)
        ))),
    }
}

fn parse_resize(value: &Value) -> Result<Dimensions, CoreError> {
    let dim = |key: &str| {
        Dimensions::side(value.get(key)).ok_or_else(|| {
            CoreError::Validation(format!(
                "resize_payload.{key} must be an integer between 1 and {MAX_IMAGE_SIDE}"
            ))
        })
    };
    Ok(Dimensions::new(dim("resize_width")?, dim("resize_height")?))
}

/// Remove `alwayson_scripts.controlnet.args` from the payload and lift
/// each entry into a [`ConditioningUnit`].
///
/// Returns `None` when the payload declares no units.
fn take_conditioning_units(
    payload: &mut Map<String, Value>,
) -> Result<Option<Vec<ConditioningUnit>>, CoreError> {
    let args = payload
        .get_mut("alwayson_scripts")
        .and_then(|s| s.get_mut("controlnet"))
        .and_then(Value::as_object_mut)
        .and_then(|c| c.remove("args"));

    let args = match args {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(args)) if args.is_empty() => return Ok(None),
        Some(Value::Array(args)) => args,
        Some(other) => {
            return Err(CoreError::Validation(format!(
                "alwayson_scripts.controlnet.args must be a list, got {}",
                json_kind(&other)
            )))
        }
    };

    let units = args
        .into_iter()
        .map(|arg| match arg {
            Value::Object(mut args) => {
                let input_image = args
                    .remove("input_image")
                    .filter(|v| !v.is_null())
                    .map(|v| parse_image(v, "input_image"))
                    .transpose()?;
                Ok(ConditioningUnit { input_image, args })
            }
            other => Err(CoreError::Validation(format!(
                "conditioning unit must be an object, got {}",
                json_kind(&other)
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(units))
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
