//! Error types for compilation requests and engine faults

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request-level failures that prevent a compilation from producing a
/// [`CompilationResult`](super::CompilationResult).
///
/// Document defects and engine faults are *results*, not errors; see
/// [`CompilationResult`](super::CompilationResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request, path traversal attempt or oversized input.
    /// Raised before any workspace or subprocess exists.
    #[error("Invalid input: {0}")]
    Input(String),

    /// The concurrency gate is saturated. Retryable.
    #[error("Compilation capacity exhausted")]
    Overloaded,

    /// Workspace allocation or population failed on the host side.
    #[error("Workspace allocation failed: {0}")]
    Resource(String),

    /// The request was cancelled before it produced a result.
    #[error("Compilation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Shorthand for [`EngineError::Input`]
    pub fn input(message: impl Into<String>) -> Self {
        EngineError::Input(message.into())
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Overloaded | EngineError::Resource(_))
    }
}

/// Why the engine failed to produce a trustworthy outcome.
///
/// The string codes returned by [`FaultReason::code`] are stable and safe to
/// expose to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultReason {
    /// Wall-clock deadline exceeded; the process group was killed
    Timeout,
    /// Engine binary does not exist
    EngineNotFound,
    /// Engine binary exists but cannot be executed
    PermissionDenied,
    /// Any other spawn failure
    SpawnFailed,
    /// Killed by SIGKILL without us asking (OOM killer)
    OutOfMemory,
    /// CPU-time rlimit reached (SIGXCPU)
    CpuLimitExceeded,
    /// Terminated by some other signal
    KilledBySignal,
    /// Exit code 0 but no artifact in the workspace
    MissingArtifact,
    /// Reading engine products from the workspace failed
    Io,
}

impl FaultReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            FaultReason::Timeout => "timeout",
            FaultReason::EngineNotFound => "engine_not_found",
            FaultReason::PermissionDenied => "permission_denied",
            FaultReason::SpawnFailed => "spawn_failed",
            FaultReason::OutOfMemory => "out_of_memory",
            FaultReason::CpuLimitExceeded => "cpu_limit_exceeded",
            FaultReason::KilledBySignal => "killed_by_signal",
            FaultReason::MissingArtifact => "missing_artifact",
            FaultReason::Io => "io",
        }
    }
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// An infrastructure-level failure of the engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFault {
    /// Stable classification
    pub reason: FaultReason,
    /// Operator-facing context (paths, OS errors, signal numbers).
    /// Logged server-side, never sent to clients.
    pub detail: String,
}

impl EngineFault {
    pub fn new(reason: FaultReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for EngineFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_codes_are_snake_case() {
        assert_eq!(FaultReason::Timeout.code(), "timeout");
        assert_eq!(FaultReason::EngineNotFound.code(), "engine_not_found");
        assert_eq!(FaultReason::OutOfMemory.to_string(), "out_of_memory");

        let json = serde_json::to_string(&FaultReason::CpuLimitExceeded).unwrap();
        assert_eq!(json, "\"cpu_limit_exceeded\"");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(EngineError::Overloaded.is_retryable());
        assert!(EngineError::Resource("disk full".into()).is_retryable());
        assert!(!EngineError::input("bad").is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }
}
