//! API handlers for the LaTeX server
//!
//! Provides REST endpoints for:
//! - Raw LaTeX compilation with auxiliary files
//! - Structured document rendering (JSON blocks to PDF)
//! - Structured document preview as LaTeX source

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use latex_engine::{
    render_document, CompilationRequest, CompilationResult, CompileOptions, OutputFormat,
    StructuredDocument,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::error::ServerError;
use crate::AppState;

pub const X_COMPILE_WARNINGS: HeaderName = HeaderName::from_static("x-compile-warnings");
pub const X_PAGE_COUNT: HeaderName = HeaderName::from_static("x-page-count");
pub const X_ARTIFACT_SHA256: HeaderName = HeaderName::from_static("x-artifact-sha256");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub engine: String,
    pub capacity: usize,
    pub in_flight: usize,
}

/// Handler: GET /health
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let gate = state.compiler.gate();
    Json(HealthResponse {
        status: "healthy",
        service: "latex-server",
        version: env!("CARGO_PKG_VERSION"),
        engine: state.compiler.config().engine.to_string(),
        capacity: gate.capacity(),
        in_flight: gate.in_flight(),
    })
}

/// Compile request body
#[derive(Deserialize)]
pub struct CompileApiRequest {
    /// Main LaTeX document
    pub source: String,

    /// Auxiliary files: relative path to base64 content
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Output format: "pdf" or "dvi"
    #[serde(default)]
    pub format: Option<String>,

    /// Per-request timeout override
    pub timeout_ms: Option<u64>,
}

/// Render request body
#[derive(Deserialize)]
pub struct RenderApiRequest {
    pub document: StructuredDocument,

    #[serde(default)]
    pub format: Option<String>,

    pub timeout_ms: Option<u64>,
}

/// LaTeX preview request body
#[derive(Deserialize)]
pub struct RenderTexRequest {
    pub document: StructuredDocument,
}

/// Build engine options from the optional request fields
pub fn parse_options(
    format: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<CompileOptions, ServerError> {
    let mut options = CompileOptions::default();
    if let Some(format) = format {
        let format: OutputFormat = format.parse().map_err(|_| {
            ServerError::InvalidRequest(format!(
                "Invalid format '{}'. Must be 'pdf' or 'dvi'",
                format
            ))
        })?;
        options = options.with_format(format);
    }
    if let Some(ms) = timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    Ok(options)
}

/// Decode base64 auxiliary files
pub fn decode_files(
    files: BTreeMap<String, String>,
) -> Result<BTreeMap<String, Vec<u8>>, ServerError> {
    files
        .into_iter()
        .map(|(name, content)| {
            STANDARD
                .decode(content.as_bytes())
                .map(|bytes| (name.clone(), bytes))
                .map_err(|e| {
                    ServerError::InvalidRequest(format!("File '{}' is not valid base64: {}", name, e))
                })
        })
        .collect()
}

/// Compiled artifact returned as the raw response body
pub struct ArtifactResponse {
    pub request_id: Uuid,
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub warnings: usize,
    pub page_count: Option<usize>,
}

impl IntoResponse for ArtifactResponse {
    fn into_response(self) -> Response {
        let digest = hex::encode(Sha256::digest(&self.bytes));
        let mut response = self.bytes.into_response();

        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.format.mime_type()),
        );
        headers.insert(X_COMPILE_WARNINGS, HeaderValue::from(self.warnings));
        if let Some(pages) = self.page_count {
            headers.insert(X_PAGE_COUNT, HeaderValue::from(pages));
        }
        if let Ok(value) = HeaderValue::from_str(&digest) {
            headers.insert(X_ARTIFACT_SHA256, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.request_id.to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
        response
    }
}

fn artifact_or_error(
    request_id: Uuid,
    result: CompilationResult,
) -> Result<ArtifactResponse, ServerError> {
    match result {
        CompilationResult::Success {
            artifact,
            format,
            warnings,
            page_count,
            ..
        } => Ok(ArtifactResponse {
            request_id,
            bytes: artifact,
            format,
            warnings: warnings.len(),
            page_count,
        }),
        CompilationResult::CompileError {
            diagnostics,
            exit_code,
        } => Err(ServerError::CompileError {
            diagnostics,
            exit_code,
        }),
        CompilationResult::EngineFault(fault) => Err(ServerError::from(fault)),
    }
}

/// Handler: POST /api/compile
pub async fn handle_compile(
    State(state): State<AppState>,
    payload: Result<Json<CompileApiRequest>, JsonRejection>,
) -> Result<ArtifactResponse, ServerError> {
    let Json(req) = payload?;
    let request_id = Uuid::new_v4();
    let span = info_span!("http_compile", %request_id);

    async move {
        info!(
            "Compile request: {} bytes, {} auxiliary files",
            req.source.len(),
            req.files.len()
        );

        let options = parse_options(req.format.as_deref(), req.timeout_ms)?;
        let request = CompilationRequest::new(req.source)
            .with_files(decode_files(req.files)?)
            .with_options(options);

        let result = state
            .compiler
            .compile_with_cancel(request, &state.shutdown.child_token())
            .await?;
        artifact_or_error(request_id, result)
    }
    .instrument(span)
    .await
}

/// Handler: POST /api/render
pub async fn handle_render(
    State(state): State<AppState>,
    payload: Result<Json<RenderApiRequest>, JsonRejection>,
) -> Result<ArtifactResponse, ServerError> {
    let Json(req) = payload?;
    let request_id = Uuid::new_v4();
    let span = info_span!("http_render", %request_id);

    async move {
        info!(
            "Render request: '{}', {} blocks",
            req.document.meta.title,
            req.document.blocks.len()
        );

        let options = parse_options(req.format.as_deref(), req.timeout_ms)?;
        let result = state
            .compiler
            .compile_document_with_cancel(&req.document, options, &state.shutdown.child_token())
            .await?;
        artifact_or_error(request_id, result)
    }
    .instrument(span)
    .await
}

/// Handler: POST /api/render/tex
pub async fn handle_render_tex(
    payload: Result<Json<RenderTexRequest>, JsonRejection>,
) -> Result<Response, ServerError> {
    let Json(req) = payload?;
    req.document
        .validate()
        .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;

    let tex = render_document(&req.document);
    Ok((
        [(header::CONTENT_TYPE, "text/x-tex; charset=utf-8")],
        tex,
    )
        .into_response())
}
