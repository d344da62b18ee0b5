/// Per-sample seed reported by the generation backend.
pub type Seed = i64;

/// Bus priority of a callback message. Lower values are served first.
pub type Priority = u8;

/// Priority used when a job does not name one.
pub const DEFAULT_CALLBACK_PRIORITY: Priority = 255;

/// Largest width or height a job may ask an image to be resized to.
pub const MAX_IMAGE_SIDE: u32 = 16_384;

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Read one side from a JSON value, accepting `1..=MAX_IMAGE_SIDE`.
    pub fn side(value: Option<&serde_json::Value>) -> Option<u32> {
        value
            .and_then(serde_json::Value::as_u64)
            .filter(|n| (1..=u64::from(MAX_IMAGE_SIDE)).contains(n))
            .map(|n| n as u32)
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
