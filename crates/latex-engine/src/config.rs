//! Compiler configuration and engine profiles
//!
//! Everything here is fixed once a [`Compiler`](crate::Compiler) is built.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compiler::OutputFormat;
use crate::gate::GatePolicy;

/// Name of the main document inside every workspace
pub const MAIN_DOCUMENT: &str = "main.tex";

/// Invalid configuration detected at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Concurrency capacity must be at least 1")]
    ZeroCapacity,

    #[error("Timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Default timeout {default:?} exceeds maximum timeout {max:?}")]
    TimeoutAboveMaximum { default: Duration, max: Duration },

    #[error("Output byte cap must be greater than zero")]
    ZeroOutputCap,

    #[error("Invalid diagnostic pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Workspace root {0} is not a usable directory")]
    WorkspaceRoot(PathBuf),
}

/// Supported engine families.
///
/// Each kind fixes the argument convention and the default line patterns used
/// to tell warnings and errors apart in the engine's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Tectonic,
    Pdflatex,
    /// Any executable taking the document path as its only argument
    Generic,
}

impl EngineKind {
    /// Program looked up on `PATH` when no explicit binary is configured
    pub fn default_program(&self) -> &'static str {
        match self {
            EngineKind::Tectonic => "tectonic",
            EngineKind::Pdflatex => "pdflatex",
            EngineKind::Generic => "latex",
        }
    }

    /// Command-line arguments for compiling `main` into `format`
    pub fn args(&self, main: &str, format: OutputFormat) -> Vec<String> {
        match self {
            EngineKind::Tectonic => vec![
                main.to_string(),
                "--outdir".to_string(),
                ".".to_string(),
                "--chatter".to_string(),
                "minimal".to_string(),
            ],
            EngineKind::Pdflatex => {
                let mut args = vec![
                    "-interaction=nonstopmode".to_string(),
                    "-halt-on-error".to_string(),
                    "-no-shell-escape".to_string(),
                    "-file-line-error".to_string(),
                ];
                if format == OutputFormat::Dvi {
                    args.push("-output-format=dvi".to_string());
                }
                args.push(main.to_string());
                args
            }
            EngineKind::Generic => vec![main.to_string()],
        }
    }

    /// Whether this engine can produce `format`
    pub fn supports(&self, format: OutputFormat) -> bool {
        match self {
            EngineKind::Pdflatex => true,
            EngineKind::Tectonic | EngineKind::Generic => format == OutputFormat::Pdf,
        }
    }

    /// Lines matching any of these are reported as warnings
    pub fn warning_patterns(&self) -> &'static [&'static str] {
        match self {
            EngineKind::Tectonic => &[r"^warning: "],
            EngineKind::Pdflatex => &[
                r"^(LaTeX|pdfTeX|Package \S+|Class \S+) Warning",
                r"^(Overfull|Underfull) \\[hv]box",
            ],
            EngineKind::Generic => &[r"(?i)\bwarning\b"],
        }
    }

    /// Lines matching any of these are reported as error diagnostics
    pub fn error_patterns(&self) -> &'static [&'static str] {
        match self {
            EngineKind::Tectonic => &[r"^error: "],
            EngineKind::Pdflatex => &[r"^! ", r"^[^:\s]+\.(tex|sty|cls):\d+: "],
            EngineKind::Generic => &[r"^! ", r"(?i)\berror\b"],
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Tectonic => write!(f, "tectonic"),
            EngineKind::Pdflatex => write!(f, "pdflatex"),
            EngineKind::Generic => write!(f, "generic"),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tectonic" => Ok(EngineKind::Tectonic),
            "pdflatex" => Ok(EngineKind::Pdflatex),
            "generic" => Ok(EngineKind::Generic),
            other => Err(format!("Unknown engine: {}", other)),
        }
    }
}

/// Per-process limits applied to the engine before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Address-space cap in bytes (RLIMIT_AS)
    pub memory_bytes: Option<u64>,
    /// CPU-time cap in seconds (RLIMIT_CPU)
    pub cpu_seconds: Option<u64>,
    /// Move the engine into an empty network namespace when the host allows it
    pub isolate_network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(1024 * 1024 * 1024),
            cpu_seconds: Some(60),
            isolate_network: true,
        }
    }
}

impl ResourceLimits {
    /// No limits at all (tests, trusted input)
    pub fn unlimited() -> Self {
        Self {
            memory_bytes: None,
            cpu_seconds: None,
            isolate_network: false,
        }
    }
}

/// Process-wide compiler configuration
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Engine family
    pub engine: EngineKind,
    /// Engine binary (absolute path or name resolved via `PATH`)
    pub program: PathBuf,
    /// Maximum simultaneous compilations
    pub capacity: usize,
    /// What happens to requests beyond capacity
    pub gate_policy: GatePolicy,
    /// Wall-clock budget per compilation
    pub default_timeout: Duration,
    /// Upper bound for per-request timeout overrides
    pub max_timeout: Duration,
    /// Bytes kept per output stream (stdout, stderr)
    pub output_cap_bytes: usize,
    /// Total bytes accepted per request (source + auxiliary files)
    pub max_input_bytes: usize,
    /// Limits applied to the engine process
    pub limits: ResourceLimits,
    /// Directory under which per-request workspaces are created
    pub workspace_root: PathBuf,
    /// Extra warning patterns on top of the engine defaults
    pub extra_warning_patterns: Vec<String>,
    /// Extra error patterns on top of the engine defaults
    pub extra_error_patterns: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::for_engine(EngineKind::default())
    }
}

impl CompilerConfig {
    /// Defaults for the given engine family
    pub fn for_engine(engine: EngineKind) -> Self {
        Self {
            engine,
            program: PathBuf::from(engine.default_program()),
            capacity: 4,
            gate_policy: GatePolicy::default(),
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
            output_cap_bytes: 256 * 1024,
            max_input_bytes: 10 * 1024 * 1024,
            limits: ResourceLimits::default(),
            workspace_root: std::env::temp_dir(),
            extra_warning_patterns: Vec::new(),
            extra_error_patterns: Vec::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_gate_policy(mut self, policy: GatePolicy) -> Self {
        self.gate_policy = policy;
        self
    }

    /// Set the default timeout, raising the maximum if needed
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        if self.max_timeout < timeout {
            self.max_timeout = timeout;
        }
        self
    }

    pub fn with_max_timeout(mut self, max: Duration) -> Self {
        self.max_timeout = max;
        self
    }

    pub fn with_output_cap(mut self, bytes: usize) -> Self {
        self.output_cap_bytes = bytes;
        self
    }

    pub fn with_max_input(mut self, bytes: usize) -> Self {
        self.max_input_bytes = bytes;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_warning_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra_warning_patterns.push(pattern.into());
        self
    }

    pub fn with_error_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra_error_patterns.push(pattern.into());
        self
    }

    /// All warning patterns in effect (engine defaults first)
    pub fn warning_patterns(&self) -> Vec<String> {
        self.engine
            .warning_patterns()
            .iter()
            .map(|p| p.to_string())
            .chain(self.extra_warning_patterns.iter().cloned())
            .collect()
    }

    /// All error patterns in effect (engine defaults first)
    pub fn error_patterns(&self) -> Vec<String> {
        self.engine
            .error_patterns()
            .iter()
            .map(|p| p.to_string())
            .chain(self.extra_error_patterns.iter().cloned())
            .collect()
    }

    /// Check invariants that cannot be expressed in the types
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.default_timeout.is_zero() || self.max_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.default_timeout > self.max_timeout {
            return Err(ConfigError::TimeoutAboveMaximum {
                default: self.default_timeout,
                max: self.max_timeout,
            });
        }
        if self.output_cap_bytes == 0 {
            return Err(ConfigError::ZeroOutputCap);
        }
        if !self.workspace_root.is_dir() {
            return Err(ConfigError::WorkspaceRoot(self.workspace_root.clone()));
        }
        for pattern in self.warning_patterns().iter().chain(&self.error_patterns()) {
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CompilerConfig::default().validate().is_ok());
        assert!(CompilerConfig::for_engine(EngineKind::Pdflatex)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CompilerConfig::default().with_capacity(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity)));
    }

    #[test]
    fn test_timeout_raises_maximum() {
        let config = CompilerConfig::default().with_timeout(Duration::from_secs(500));
        assert_eq!(config.max_timeout, Duration::from_secs(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let config = CompilerConfig::default().with_warning_pattern("(unclosed");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_missing_workspace_root_rejected() {
        let config = CompilerConfig::default().with_workspace_root("/definitely/not/here");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WorkspaceRoot(_))
        ));
    }

    #[test]
    fn test_pdflatex_args() {
        let args = EngineKind::Pdflatex.args(MAIN_DOCUMENT, OutputFormat::Dvi);
        assert_eq!(args.last().map(String::as_str), Some(MAIN_DOCUMENT));
        assert!(args.contains(&"-output-format=dvi".to_string()));
        assert!(args.contains(&"-no-shell-escape".to_string()));

        let args = EngineKind::Pdflatex.args(MAIN_DOCUMENT, OutputFormat::Pdf);
        assert!(!args.iter().any(|a| a.starts_with("-output-format")));
    }

    #[test]
    fn test_generic_passes_only_the_document() {
        assert_eq!(
            EngineKind::Generic.args(MAIN_DOCUMENT, OutputFormat::Pdf),
            vec![MAIN_DOCUMENT.to_string()]
        );
    }

    #[test]
    fn test_format_support() {
        assert!(EngineKind::Pdflatex.supports(OutputFormat::Dvi));
        assert!(!EngineKind::Tectonic.supports(OutputFormat::Dvi));
        assert!(EngineKind::Generic.supports(OutputFormat::Pdf));
    }

    #[test]
    fn test_patterns_include_extras() {
        let config = CompilerConfig::for_engine(EngineKind::Tectonic)
            .with_warning_pattern("^note: ");
        let patterns = config.warning_patterns();
        assert_eq!(patterns.first().map(String::as_str), Some("^warning: "));
        assert_eq!(patterns.last().map(String::as_str), Some("^note: "));
    }
}
