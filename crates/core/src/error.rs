#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}
