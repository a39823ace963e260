//! Request orchestration
//!
//! [`Compiler`] composes the gate, workspace manager, engine invoker and
//! result interpreter. Each request moves through
//!
//! ```text
//! Received → Admitted → WorkspacePrepared → EngineRunning → Interpreted → Released → Responded
//! ```
//!
//! and ends in `Aborted` instead when it is cancelled or fails before a
//! result exists. Resources are released in reverse order of acquisition on
//! every path: engine process group, then workspace, then gate permit. When
//! the request future is dropped mid-flight the same order holds, because the
//! guards owning those resources are dropped innermost first.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use super::errors::EngineError;
use super::{CompilationRequest, CompilationResult, CompileOptions};
use crate::config::{CompilerConfig, ConfigError, MAIN_DOCUMENT};
use crate::document::{render_document, StructuredDocument};
use crate::gate::ConcurrencyGate;
use crate::interpreter::{DiagnosticPatterns, ResultInterpreter};
use crate::invoker::{EngineInvoker, InvokeError};
use crate::workspace::{sanitize_relative_path, Workspace, WorkspaceManager};

/// Lifecycle phase of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPhase {
    Received,
    Admitted,
    WorkspacePrepared,
    EngineRunning,
    Interpreted,
    Released,
    Responded,
    Aborted,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestPhase::Responded | RequestPhase::Aborted)
    }
}

/// Callback notified on every phase transition
pub type PhaseObserver = Arc<dyn Fn(u64, RequestPhase) + Send + Sync>;

struct Lifecycle {
    request_id: u64,
    phase: RequestPhase,
    observer: Option<PhaseObserver>,
}

impl Lifecycle {
    fn new(request_id: u64, observer: Option<PhaseObserver>) -> Self {
        let lifecycle = Self {
            request_id,
            phase: RequestPhase::Received,
            observer,
        };
        lifecycle.notify();
        lifecycle
    }

    fn advance(&mut self, next: RequestPhase) {
        debug_assert!(
            next > self.phase && !self.phase.is_terminal(),
            "invalid transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(from = ?self.phase, to = ?next, "Request phase");
        self.phase = next;
        self.notify();
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer(self.request_id, self.phase);
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            debug!(phase = ?self.phase, "Request dropped before completion");
            self.phase = RequestPhase::Aborted;
            self.notify();
        }
    }
}

/// Entry point for compilations.
///
/// Cheap to clone; clones share the same gate.
#[derive(Clone)]
pub struct Compiler {
    config: Arc<CompilerConfig>,
    gate: ConcurrencyGate,
    workspaces: WorkspaceManager,
    invoker: EngineInvoker,
    interpreter: ResultInterpreter,
    next_request_id: Arc<AtomicU64>,
    observer: Option<PhaseObserver>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    /// Validate `config` and build a compiler around it
    pub fn new(config: CompilerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let patterns = DiagnosticPatterns::from_config(&config)?;

        Ok(Self {
            gate: ConcurrencyGate::new(config.capacity, config.gate_policy),
            workspaces: WorkspaceManager::new(&config.workspace_root),
            invoker: EngineInvoker::new(&config),
            interpreter: ResultInterpreter::new(patterns),
            config: Arc::new(config),
            next_request_id: Arc::new(AtomicU64::new(1)),
            observer: None,
        })
    }

    /// Observe phase transitions of every request
    pub fn with_phase_observer(mut self, observer: PhaseObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Compile `request` to completion
    pub async fn compile(
        &self,
        request: CompilationRequest,
    ) -> Result<CompilationResult, EngineError> {
        self.compile_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Compile `request`, aborting as soon as `cancel` fires.
    ///
    /// Cancellation before admission never spawns the engine; afterwards
    /// the engine's process group is killed before the workspace is deleted.
    #[instrument(name = "compile", skip_all, fields(request_id = tracing::field::Empty))]
    pub async fn compile_with_cancel(
        &self,
        request: CompilationRequest,
        cancel: &CancellationToken,
    ) -> Result<CompilationResult, EngineError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        Span::current().record("request_id", request_id);

        let mut lifecycle = Lifecycle::new(request_id, self.observer.clone());
        let outcome = self.drive(&request, cancel, &mut lifecycle).await;

        match &outcome {
            Ok(result) => {
                lifecycle.advance(RequestPhase::Responded);
                log_result(result);
            }
            Err(e) => {
                lifecycle.advance(RequestPhase::Aborted);
                log_error(e);
            }
        }
        outcome
    }

    /// Render a structured document to LaTeX and compile it
    pub async fn compile_document(
        &self,
        document: &StructuredDocument,
        options: CompileOptions,
    ) -> Result<CompilationResult, EngineError> {
        self.compile_document_with_cancel(document, options, &CancellationToken::new())
            .await
    }

    pub async fn compile_document_with_cancel(
        &self,
        document: &StructuredDocument,
        options: CompileOptions,
        cancel: &CancellationToken,
    ) -> Result<CompilationResult, EngineError> {
        document
            .validate()
            .map_err(|e| EngineError::Input(e.to_string()))?;
        let source = render_document(document);
        let request = CompilationRequest::new(source).with_options(options);
        self.compile_with_cancel(request, cancel).await
    }

    async fn drive(
        &self,
        request: &CompilationRequest,
        cancel: &CancellationToken,
        lifecycle: &mut Lifecycle,
    ) -> Result<CompilationResult, EngineError> {
        let timeout = self.validate(request)?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.gate.admit() => permit?,
        };
        lifecycle.advance(RequestPhase::Admitted);

        let mut workspace = self.workspaces.acquire()?;
        let result = self
            .run(&workspace, request, timeout, cancel, lifecycle)
            .await;

        workspace.release();
        lifecycle.advance(RequestPhase::Released);
        result
    }

    async fn run(
        &self,
        workspace: &Workspace,
        request: &CompilationRequest,
        timeout: Duration,
        cancel: &CancellationToken,
        lifecycle: &mut Lifecycle,
    ) -> Result<CompilationResult, EngineError> {
        self.workspaces
            .populate(workspace, MAIN_DOCUMENT, request.source(), request.files())
            .await?;
        lifecycle.advance(RequestPhase::WorkspacePrepared);

        let format = request.options().format;
        let deadline = Instant::now() + timeout;
        lifecycle.advance(RequestPhase::EngineRunning);

        let result = match self
            .invoker
            .invoke(workspace, format, deadline, cancel)
            .await
        {
            Ok(outcome) => self.interpreter.interpret(workspace, format, &outcome).await,
            Err(InvokeError::Spawn(fault)) => CompilationResult::EngineFault(fault),
            Err(InvokeError::Cancelled) => return Err(EngineError::Cancelled),
        };
        lifecycle.advance(RequestPhase::Interpreted);

        Ok(result)
    }

    /// Checks done before admission; returns the effective timeout
    fn validate(&self, request: &CompilationRequest) -> Result<Duration, EngineError> {
        if request.source().is_empty() {
            return Err(EngineError::input("document source is empty"));
        }

        let size = request.input_size();
        if size > self.config.max_input_bytes {
            return Err(EngineError::input(format!(
                "input of {} bytes exceeds the limit of {} bytes",
                size, self.config.max_input_bytes
            )));
        }

        let format = request.options().format;
        if !self.config.engine.supports(format) {
            return Err(EngineError::input(format!(
                "engine {} cannot produce {} output",
                self.config.engine, format
            )));
        }

        let mut entries = BTreeSet::new();
        entries.insert(PathBuf::from(MAIN_DOCUMENT));
        for name in request.files().keys() {
            let relative = sanitize_relative_path(name)?;
            if relative == Path::new(MAIN_DOCUMENT) {
                return Err(EngineError::input(format!(
                    "auxiliary file {} would replace the main document",
                    name
                )));
            }
            if !entries.insert(relative) {
                return Err(EngineError::input(format!("duplicate file entry: {}", name)));
            }
        }

        // A file cannot also be the directory of another entry
        for entry in &entries {
            if let Some(clash) = entry.ancestors().skip(1).find(|dir| entries.contains(*dir)) {
                return Err(EngineError::input(format!(
                    "{} is both a file and the directory of {}",
                    clash.display(),
                    entry.display()
                )));
            }
        }

        match request.options().timeout {
            None => Ok(self.config.default_timeout),
            Some(t) if t.is_zero() => Err(EngineError::input("timeout must be positive")),
            Some(t) if t > self.config.max_timeout => Err(EngineError::input(format!(
                "timeout {:?} exceeds the maximum of {:?}",
                t, self.config.max_timeout
            ))),
            Some(t) => Ok(t),
        }
    }
}

fn log_result(result: &CompilationResult) {
    match result {
        CompilationResult::Success {
            artifact,
            warnings,
            duration,
            ..
        } => info!(
            bytes = artifact.len(),
            warnings = warnings.len(),
            duration_ms = duration.as_millis() as u64,
            "Compilation succeeded"
        ),
        CompilationResult::CompileError {
            diagnostics,
            exit_code,
        } => info!(
            exit_code,
            diagnostics = diagnostics.len(),
            "Document has errors"
        ),
        CompilationResult::EngineFault(fault) => error!(
            reason = %fault.reason,
            detail = %fault.detail,
            "Engine fault"
        ),
    }
}

fn log_error(error: &EngineError) {
    match error {
        EngineError::Input(msg) => debug!(reason = %msg, "Request rejected"),
        EngineError::Overloaded => warn!("Request rejected: compilation capacity exhausted"),
        EngineError::Resource(msg) => error!(reason = %msg, "Workspace allocation failed"),
        EngineError::Cancelled => info!("Compilation cancelled"),
    }
}
