//! Classification of engine runs into [`CompilationResult`]s
//!
//! Which output lines count as warnings or errors depends on the engine; the
//! pattern sets come from [`EngineKind`](crate::EngineKind) defaults plus any
//! configured extras.

use regex::{Regex, RegexSet};
use tracing::debug;

use crate::compiler::{CompilationResult, EngineFault, FaultReason, OutputFormat};
use crate::config::{CompilerConfig, ConfigError};
use crate::invoker::InvocationOutcome;
use crate::workspace::Workspace;

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// Compiled warning / error line patterns
#[derive(Debug, Clone)]
pub struct DiagnosticPatterns {
    warnings: RegexSet,
    errors: RegexSet,
    context: Regex,
}

impl DiagnosticPatterns {
    pub fn new<W, E>(warnings: W, errors: E) -> Result<Self, ConfigError>
    where
        W: IntoIterator,
        W::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            warnings: build_set(warnings)?,
            errors: build_set(errors)?,
            context: Regex::new(r"^l\.\d+ ").map_err(|source| ConfigError::InvalidPattern {
                pattern: r"^l\.\d+ ".to_string(),
                source,
            })?,
        })
    }

    pub fn from_config(config: &CompilerConfig) -> Result<Self, ConfigError> {
        Self::new(config.warning_patterns(), config.error_patterns())
    }

    pub fn is_warning(&self, line: &str) -> bool {
        self.warnings.is_match(line)
    }

    pub fn is_error(&self, line: &str) -> bool {
        self.errors.is_match(line)
    }

    /// Warning lines in emission order (stderr first, then stdout)
    pub fn warnings(&self, outcome: &InvocationOutcome) -> Vec<String> {
        log_lines(outcome)
            .filter(|line| self.is_warning(line))
            .map(str::to_string)
            .collect()
    }

    /// Error diagnostics in emission order.
    ///
    /// Each matching line is followed by its `l.<n>` source context line when
    /// the engine printed one. Stderr is never dropped: when none of its
    /// lines match, all of them are kept. Stdout is filtered by the patterns
    /// unless neither stream matched anything, in which case every non-empty
    /// line is returned.
    pub fn diagnostics(&self, outcome: &InvocationOutcome) -> Vec<String> {
        let stderr: Vec<&str> = stream_lines(&outcome.stderr).collect();
        let stdout: Vec<&str> = stream_lines(&outcome.stdout).collect();

        let mut diagnostics = self.matching(&stderr);
        if diagnostics.is_empty() {
            diagnostics = non_empty(&stderr);
        }
        let from_stdout = self.matching(&stdout);
        if diagnostics.is_empty() && from_stdout.is_empty() {
            return non_empty(&stdout);
        }
        diagnostics.extend(from_stdout);
        diagnostics
    }

    fn matching(&self, lines: &[&str]) -> Vec<String> {
        let mut matched = Vec::new();
        let mut iter = lines.iter().peekable();
        while let Some(line) = iter.next() {
            if !self.is_error(line) {
                continue;
            }
            matched.push(line.to_string());
            while let Some(next) = iter.peek() {
                if self.context.is_match(next) {
                    matched.push(next.to_string());
                    iter.next();
                } else if next.trim().is_empty() {
                    iter.next();
                } else {
                    break;
                }
            }
        }
        matched
    }
}

fn non_empty(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect()
}

fn build_set<I>(patterns: I) -> Result<RegexSet, ConfigError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let patterns: Vec<String> = patterns
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect();
    RegexSet::new(&patterns).map_err(|source| ConfigError::InvalidPattern {
        pattern: patterns.join(" | "),
        source,
    })
}

fn stream_lines(stream: &str) -> impl Iterator<Item = &str> {
    stream.lines().map(|line| line.trim_end_matches('\r'))
}

fn log_lines(outcome: &InvocationOutcome) -> impl Iterator<Item = &str> {
    stream_lines(&outcome.stderr).chain(stream_lines(&outcome.stdout))
}

/// Maps an [`InvocationOutcome`] plus workspace contents to a result
#[derive(Debug, Clone)]
pub struct ResultInterpreter {
    patterns: DiagnosticPatterns,
}

impl ResultInterpreter {
    pub fn new(patterns: DiagnosticPatterns) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &DiagnosticPatterns {
        &self.patterns
    }

    /// Classify a finished run.
    ///
    /// - deadline hit ⇒ `EngineFault(timeout)`
    /// - killed by a signal we did not send ⇒ `EngineFault` (OOM, CPU, other)
    /// - exit 0 with artifact ⇒ `Success`
    /// - exit 0 without artifact ⇒ `EngineFault(missing_artifact)`
    /// - non-zero exit ⇒ `CompileError` (any partial artifact is discarded)
    pub async fn interpret(
        &self,
        workspace: &Workspace,
        format: OutputFormat,
        outcome: &InvocationOutcome,
    ) -> CompilationResult {
        if outcome.timed_out {
            return CompilationResult::EngineFault(EngineFault::new(
                FaultReason::Timeout,
                format!("engine exceeded deadline after {:?}", outcome.duration),
            ));
        }

        if let Some(signal) = outcome.signal {
            let reason = match signal {
                SIGKILL if !outcome.forced_termination => FaultReason::OutOfMemory,
                SIGXCPU => FaultReason::CpuLimitExceeded,
                _ => FaultReason::KilledBySignal,
            };
            return CompilationResult::EngineFault(EngineFault::new(
                reason,
                format!("engine terminated by signal {}", signal),
            ));
        }

        let Some(exit_code) = outcome.exit_code else {
            return CompilationResult::EngineFault(EngineFault::new(
                FaultReason::KilledBySignal,
                "engine exit status unavailable",
            ));
        };

        let artifact_path = workspace
            .path()
            .join(crate::config::MAIN_DOCUMENT)
            .with_extension(format.extension());

        if exit_code != 0 {
            let diagnostics = self.patterns.diagnostics(outcome);
            debug!(exit_code, count = diagnostics.len(), "Document failed to compile");
            return CompilationResult::CompileError {
                diagnostics,
                exit_code,
            };
        }

        let artifact = match tokio::fs::read(&artifact_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CompilationResult::EngineFault(EngineFault::new(
                    FaultReason::MissingArtifact,
                    format!(
                        "engine exited 0 but {} was not produced",
                        artifact_path.display()
                    ),
                ));
            }
            Err(e) => {
                return CompilationResult::EngineFault(EngineFault::new(
                    FaultReason::Io,
                    format!("cannot read {}: {}", artifact_path.display(), e),
                ));
            }
        };

        let page_count = match format {
            OutputFormat::Pdf => count_pdf_pages(&artifact),
            OutputFormat::Dvi => None,
        };

        CompilationResult::Success {
            artifact,
            format,
            warnings: self.patterns.warnings(outcome),
            page_count,
            duration: outcome.duration,
        }
    }
}

/// Page count of a PDF, `None` when it cannot be parsed
pub fn count_pdf_pages(bytes: &[u8]) -> Option<usize> {
    lopdf::Document::load_mem(bytes)
        .ok()
        .map(|doc| doc.get_pages().len())
}
