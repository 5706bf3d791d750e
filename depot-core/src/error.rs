use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Field → message accumulator used by schema validation and hooks.
///
/// Keys are sorted so error bodies are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub BTreeMap<String, String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), message.into());
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Errors surfaced by the request pipeline.
///
/// Each variant has a fixed HTTP mapping (see [`PipelineError::status_code`]).
/// Store and script internals are logged with detail where they occur and
/// carried here with an opaque message only.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Non-empty field → message map from schema validation or hooks.
    Validation(ValidationErrors),

    /// A hook called `cancel(message, status)`.
    Cancelled { message: String, status: u16 },

    /// No document matched the requested id.
    NotFound(String),

    /// A unique-constrained property collided on write.
    UniqueConflict { field: String },

    /// Missing or invalid credentials.
    Unauthorized(String),

    /// Valid credentials, insufficient rights.
    Forbidden(String),

    /// Malformed query or payload.
    BadRequest(String),

    /// A hook failed to execute (compile error, runtime exception, panic).
    Script(String),

    /// Everything else; details live in the logs only.
    Internal(String),
}

impl PipelineError {
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 400,
            PipelineError::Cancelled { status, .. } => *status,
            PipelineError::NotFound(_) => 404,
            PipelineError::UniqueConflict { .. } => 409,
            PipelineError::Unauthorized(_) => 401,
            PipelineError::Forbidden(_) => 403,
            PipelineError::BadRequest(_) => 400,
            PipelineError::Script(_) => 500,
            PipelineError::Internal(_) => 500,
        }
    }

    /// The JSON body the HTTP layer serves for this error.
    pub fn body(&self) -> serde_json::Value {
        match self {
            PipelineError::Validation(errors) => serde_json::json!({ "errors": errors }),
            PipelineError::Cancelled { message, .. } => {
                serde_json::json!({ "message": message })
            }
            PipelineError::NotFound(msg) => serde_json::json!({ "message": msg }),
            PipelineError::UniqueConflict { field } => {
                let mut errors = serde_json::Map::new();
                errors.insert(field.clone(), "is already taken".into());
                serde_json::json!({ "errors": errors })
            }
            PipelineError::Unauthorized(msg)
            | PipelineError::Forbidden(msg)
            | PipelineError::BadRequest(msg) => serde_json::json!({ "message": msg }),
            PipelineError::Script(_) | PipelineError::Internal(_) => {
                serde_json::json!({ "message": "internal error" })
            }
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Validation(errors) => {
                write!(f, "validation failed: {} field(s)", errors.len())
            }
            PipelineError::Cancelled { message, status } => {
                write!(f, "cancelled ({status}): {message}")
            }
            PipelineError::NotFound(msg) => write!(f, "not found: {msg}"),
            PipelineError::UniqueConflict { field } => write!(f, "unique conflict on {field}"),
            PipelineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            PipelineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            PipelineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            PipelineError::Script(msg) => write!(f, "script error: {msg}"),
            PipelineError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}
