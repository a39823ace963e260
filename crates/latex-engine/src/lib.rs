//! LaTeX compilation engine
//!
//! This crate drives an external, sandboxed TeX engine (tectonic, pdflatex or
//! any executable following the same contract) and turns its run into a typed
//! result:
//! - Per-request temporary workspaces with path-traversal checks
//! - Engine invocation with deadlines, bounded output capture and rlimits
//! - Classification into success, compile error or engine fault
//! - A counting gate bounding simultaneous compilations
//! - Rendering of structured JSON documents into LaTeX
//!
//! The entry point is [`Compiler`]:
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use latex_engine::{CompilationRequest, CompilationResult, Compiler, CompilerConfig, EngineKind};
//!
//! let compiler = Compiler::new(CompilerConfig::for_engine(EngineKind::Pdflatex))?;
//! let request = CompilationRequest::new(r"\documentclass{article}\begin{document}Hi\end{document}");
//! match compiler.compile(request).await? {
//!     CompilationResult::Success { artifact, .. } => println!("{} bytes", artifact.len()),
//!     CompilationResult::CompileError { diagnostics, .. } => eprintln!("{diagnostics:?}"),
//!     CompilationResult::EngineFault(fault) => eprintln!("{}", fault.reason),
//! }
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod config;
pub mod document;
pub mod gate;
pub mod interpreter;
pub mod invoker;
pub mod workspace;

pub use compiler::{
    CompilationRequest, CompilationResult, CompileOptions, Compiler, EngineError, EngineFault,
    FaultReason, OutputFormat, RequestPhase,
};
pub use config::{CompilerConfig, ConfigError, EngineKind, ResourceLimits};
pub use document::{render_document, DocumentError, StructuredDocument};
pub use gate::{ConcurrencyGate, GatePermit, GatePolicy};

/// Re-exported so callers can cancel in-flight compilations without a direct
/// `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
