//! Error types for the LaTeX server

use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use latex_engine::{EngineError, EngineFault, FaultReason};
use serde::Serialize;
use thiserror::Error;

/// Seconds clients should wait before retrying an overloaded server
const RETRY_AFTER_SECS: &str = "2";

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Document failed to compile (exit code {exit_code})")]
    CompileError {
        diagnostics: Vec<String>,
        exit_code: i32,
    },

    #[error("Compilation capacity exhausted")]
    Overloaded,

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Engine timed out")]
    EngineTimeout,

    #[error("Engine fault: {0}")]
    EngineFault(FaultReason),

    #[error("Compilation cancelled")]
    Cancelled,

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<Vec<String>>,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Messages never carry engine output beyond diagnostics, nor host paths
        let (status, code, message) = match &self {
            ServerError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", msg.clone())
            }
            ServerError::CompileError { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "COMPILE_ERROR",
                self.to_string(),
            ),
            ServerError::Overloaded => (
                StatusCode::SERVICE_UNAVAILABLE,
                "OVERLOADED",
                "Server is busy, retry later".to_string(),
            ),
            ServerError::Resource(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "RESOURCE_ERROR",
                "Temporarily unable to allocate compilation resources".to_string(),
            ),
            ServerError::EngineTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "ENGINE_TIMEOUT",
                "Compilation exceeded its time limit".to_string(),
            ),
            ServerError::EngineFault(reason) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENGINE_FAULT",
                format!("Compilation engine failed ({})", reason),
            ),
            ServerError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CANCELLED",
                "Server is shutting down".to_string(),
            ),
            ServerError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg.clone())
            }
        };

        let retryable = matches!(self, ServerError::Overloaded | ServerError::Cancelled);
        let diagnostics = match self {
            ServerError::CompileError { diagnostics, .. } => Some(diagnostics),
            _ => None,
        };

        let body = ErrorResponse {
            success: false,
            error: message,
            code: code.to_string(),
            diagnostics,
        };

        if retryable {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], Json(body)).into_response()
        } else {
            (status, Json(body)).into_response()
        }
    }
}

impl From<EngineError> for ServerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Input(msg) => ServerError::InvalidRequest(msg),
            EngineError::Overloaded => ServerError::Overloaded,
            EngineError::Resource(msg) => ServerError::Resource(msg),
            EngineError::Cancelled => ServerError::Cancelled,
        }
    }
}

impl From<EngineFault> for ServerError {
    fn from(fault: EngineFault) -> Self {
        match fault.reason {
            FaultReason::Timeout => ServerError::EngineTimeout,
            reason => ServerError::EngineFault(reason),
        }
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServerError::PayloadTooLarge(rejection.body_text())
        } else {
            ServerError::InvalidRequest(rejection.body_text())
        }
    }
}
