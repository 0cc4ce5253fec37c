//! Custom error types for the amira-asr-runtime.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.
//!
//! `ModelLoad` is the only kind that is fatal to the process; every other kind is
//! session-local and is converted into an error event at the session boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

/// Primary error type for the application, covering all possible error cases.
#[derive(Debug, Error)]
pub enum AppError {
    /// The acoustic model could not be loaded (unreadable file, corrupt weights,
    /// or the requested accelerator is not available).
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// A caller-supplied batch violated a shape precondition.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A decode step failed for a single session.
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// A malformed or out-of-state control/data frame.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The session was torn down by the client.
    #[error("Session cancelled")]
    Cancelled,

    /// Errors from invalid input data or parameters.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Errors from invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Service capacity limit reached.
    #[error("Service capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Internal server errors.
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ModelLoad(_) => "model_load_error",
            AppError::ShapeMismatch(_) => "shape_mismatch",
            AppError::DecodeFailure(_) => "decode_failure",
            AppError::ProtocolViolation(_) => "protocol_violation",
            AppError::Cancelled => "cancelled",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Configuration(_) => "configuration_error",
            AppError::CapacityExceeded(_) => "capacity_exceeded",
            AppError::Internal(_) => "internal_error",
            AppError::Io(_) => "io_error",
            AppError::Json(_) => "json_error",
        }
    }
}

/// Implementation to convert AppError into an HTTP response for Axum.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::ShapeMismatch(_)
            | AppError::InvalidInput(_)
            | AppError::ProtocolViolation(_)
            | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type Result<T> = std::result::Result<T, AppError>;
