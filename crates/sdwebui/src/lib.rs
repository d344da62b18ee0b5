//! Stable Diffusion WebUI REST client.
//!
//! Provides the retrying HTTP transport every backend call goes through,
//! typed wrappers for the endpoints the worker uses, response parsing,
//! and the startup readiness probe.

pub mod api;
pub mod messages;
pub mod readiness;
pub mod transport;

pub use api::{SdWebUiApi, SdWebUiError};
pub use transport::{CallKind, ResilientClient, RetryPolicy, TransportError};
