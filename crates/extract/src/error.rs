use thiserror::Error;

/// Failures talking to a language model backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("API error [{status}]: {message}")]
    Api { status: u16, message: String },
    #[error("In-process generation failed: {0}")]
    Generation(String),
    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Errors worth retrying with backoff before giving up on the backend.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Rejections raised while building or registering a schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid field name '{field}': names must be snake_case (e.g. switching_layer_material)")]
    InvalidFieldName { field: String },
    #[error("duplicate field name '{field}'")]
    DuplicateField { field: String },
    #[error("schema must define at least one field")]
    Empty,
    #[error("invalid owner key '{0}'")]
    InvalidOwner(String),
    #[error("no schema registered for owner '{0}'")]
    NotFound(String),
    #[error("schema persistence failed: {0}")]
    Persistence(String),
}

/// Hard failures of an extraction call. Validation problems never show up
/// here; they end as a degraded outcome instead.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("LLM backend unavailable: {0}")]
    BackendUnavailable(#[source] LlmError),
    #[error("extraction cancelled")]
    Cancelled,
}

impl From<LlmError> for ExtractError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => ExtractError::Cancelled,
            other => ExtractError::BackendUnavailable(other),
        }
    }
}
