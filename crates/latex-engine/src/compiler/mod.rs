//! Compilation requests, results and the request orchestrator

pub mod errors;
pub mod orchestrator;
pub mod output;

pub use errors::{EngineError, EngineFault, FaultReason};
pub use orchestrator::{Compiler, RequestPhase};
pub use output::OutputFormat;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-request compiler options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Artifact format
    #[serde(default)]
    pub format: OutputFormat,
    /// Overrides the configured default timeout, bounded by the maximum
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl CompileOptions {
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A document plus its auxiliary files, ready to compile.
///
/// Built once, then only read; auxiliary file names are unique map keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationRequest {
    source: Vec<u8>,
    files: BTreeMap<String, Vec<u8>>,
    options: CompileOptions,
}

impl CompilationRequest {
    pub fn new(source: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            files: BTreeMap::new(),
            options: CompileOptions::default(),
        }
    }

    /// Add an auxiliary file (image, `.bib`, included `.tex`, ...)
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    pub fn with_files<I, N, C>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<Vec<u8>>,
    {
        self.files
            .extend(files.into_iter().map(|(n, c)| (n.into(), c.into())));
        self
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Total payload size in bytes
    pub fn input_size(&self) -> usize {
        self.source.len() + self.files.values().map(Vec::len).sum::<usize>()
    }
}

/// Outcome of a compilation that reached the engine.
///
/// Exactly one variant; match it exhaustively at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationResult {
    /// The engine produced an artifact
    Success {
        artifact: Vec<u8>,
        format: OutputFormat,
        /// Warning lines in emission order
        warnings: Vec<String>,
        /// Page count for PDF artifacts that could be parsed
        page_count: Option<usize>,
        duration: Duration,
    },
    /// The document has defects; diagnostics come verbatim from the engine
    CompileError {
        diagnostics: Vec<String>,
        exit_code: i32,
    },
    /// Infrastructure failure (timeout, missing binary, OOM, ...)
    EngineFault(EngineFault),
}

impl CompilationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CompilationResult::Success { .. })
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CompilationResult::Success { .. } => "success",
            CompilationResult::CompileError { .. } => "compile_error",
            CompilationResult::EngineFault(_) => "engine_fault",
        }
    }
}
