//! Engine Error Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Errors surfaced by the data access engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Raised by hook callbacks; propagated unchanged.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn unknown_table(name: &str) -> Self {
        EngineError::Schema(format!("Unknown table: {}", name))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A single field-level violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub path: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Every violation found while validating one write.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub errors: Vec<FieldViolation>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed:")?;
        for (i, v) in self.errors.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{}{}: {}", sep, v.path, v.message)?;
        }
        Ok(())
    }
}

/// Failures raised by the underlying store. Never retried by the engine.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid backend configuration: {0}")]
    Config(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
