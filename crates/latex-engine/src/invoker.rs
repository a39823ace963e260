//! External engine invocation
//!
//! Spawns the TeX engine inside a workspace and waits for it under a hard
//! wall-clock deadline. The engine runs in its own process group so that a
//! timeout or cancellation kills it together with everything it forked.
//!
//! Output is captured into bounded buffers; the pipes keep being drained past
//! the cap so a chatty engine never blocks on a full pipe.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compiler::{EngineFault, FaultReason, OutputFormat};
use crate::config::{CompilerConfig, EngineKind, ResourceLimits, MAIN_DOCUMENT};
use crate::workspace::Workspace;

/// Environment variables passed through from the host; everything else is
/// cleared before exec.
const PASSTHROUGH_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "TEXMFHOME",
    "TEXMFVAR",
    "TEXMFCACHE",
    "TEXMFCNF",
    "XDG_CACHE_HOME",
    "TECTONIC_CACHE_DIR",
    "SOURCE_DATE_EPOCH",
];

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long pipe readers may keep running after the process group is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// What happened to one engine run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Captured stdout (lossy UTF-8, possibly truncated)
    pub stdout: String,
    /// Captured stderr (lossy UTF-8, possibly truncated)
    pub stderr: String,
    /// Wall-clock duration from spawn to exit
    pub duration: Duration,
    /// We killed the process group before it exited on its own
    pub forced_termination: bool,
    /// The forced termination was caused by the deadline
    pub timed_out: bool,
}

impl InvocationOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Invocation failures that are not engine outcomes
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The engine never started (binary missing, not executable, ...)
    #[error("Failed to start engine: {0}")]
    Spawn(EngineFault),

    /// The caller cancelled; the process group has been killed
    #[error("Invocation cancelled")]
    Cancelled,
}

/// Kills the engine's process group at most once; on drop if nobody did.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    /// No group is held for a missing or zero pid; `killpg(0)` would hit our own group
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid
                .and_then(|pid| i32::try_from(pid).ok())
                .filter(|&pid| pid > 0)
                .map(Pid::from_raw),
        }
    }

    /// SIGKILL the whole group. Returns whether any process was signalled.
    fn kill(&mut self) -> bool {
        let Some(pgid) = self.pgid.take() else {
            return false;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill engine process group");
                false
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.kill() {
            debug!("Engine process group killed on drop");
        }
    }
}

#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    total: usize,
}

impl CapturedOutput {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        let omitted = self.total.saturating_sub(self.bytes.len());
        if omitted > 0 {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[output truncated: {} of {} bytes omitted]",
                omitted, self.total
            ));
        }
        text
    }
}

/// Read `reader` to EOF keeping at most `cap` bytes
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> CapturedOutput {
    let mut out = CapturedOutput::default();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                out.total += n;
                let room = cap.saturating_sub(out.bytes.len());
                out.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Engine output pipe failed");
                break;
            }
        }
    }
    out
}

async fn collect(handle: Option<JoinHandle<CapturedOutput>>) -> CapturedOutput {
    let Some(handle) = handle else {
        return CapturedOutput::default();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(join_error)) => {
            debug!(error = %join_error, "Output reader failed");
            CapturedOutput::default()
        }
        Err(_elapsed) => {
            // A descendant escaped the process group and still holds the pipe
            warn!("Engine output pipe still open after kill");
            abort.abort();
            CapturedOutput::default()
        }
    }
}

/// One running engine process, owned by a single request
struct EngineInvocation {
    child: Child,
    group: ProcessGroup,
    started: Instant,
    deadline: Instant,
    stdout: Option<JoinHandle<CapturedOutput>>,
    stderr: Option<JoinHandle<CapturedOutput>>,
}

enum Waited {
    Exited(ExitStatus),
    WaitFailed(io::Error),
    TimedOut,
    Cancelled,
}

impl EngineInvocation {
    async fn wait(mut self, cancel: &CancellationToken) -> Result<InvocationOutcome, InvokeError> {
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            res = tokio::time::timeout_at(self.deadline, self.child.wait()) => match res {
                Ok(Ok(status)) => Waited::Exited(status),
                Ok(Err(e)) => Waited::WaitFailed(e),
                Err(_elapsed) => Waited::TimedOut,
            },
        };

        let (status, forced, timed_out) = match waited {
            Waited::Exited(status) => {
                if self.group.kill() {
                    debug!("Killed leftover engine descendants");
                }
                (Some(status), false, false)
            }
            Waited::TimedOut => {
                warn!(
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "Engine deadline exceeded, killing process group"
                );
                self.group.kill();
                (self.child.wait().await.ok(), true, true)
            }
            Waited::Cancelled => {
                debug!("Invocation cancelled, killing process group");
                self.group.kill();
                let _ = self.child.wait().await;
                if let Some(h) = self.stdout.take() {
                    h.abort();
                }
                if let Some(h) = self.stderr.take() {
                    h.abort();
                }
                return Err(InvokeError::Cancelled);
            }
            Waited::WaitFailed(e) => {
                self.group.kill();
                let _ = self.child.wait().await;
                return Err(InvokeError::Spawn(EngineFault::new(
                    FaultReason::SpawnFailed,
                    format!("waiting for engine failed: {}", e),
                )));
            }
        };
        let duration = self.started.elapsed();

        let stdout = collect(self.stdout.take()).await.into_text();
        let stderr = collect(self.stderr.take()).await.into_text();

        let (exit_code, signal) = match status {
            Some(status) => (status.code(), exit_signal(&status)),
            None => (None, None),
        };

        debug!(
            ?exit_code,
            ?signal,
            forced,
            duration_ms = duration.as_millis() as u64,
            "Engine finished"
        );

        Ok(InvocationOutcome {
            exit_code,
            signal,
            stdout,
            stderr,
            duration,
            forced_termination: forced,
            timed_out,
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Applied in the forked child right before exec.
#[cfg(target_os = "linux")]
fn apply_limits(limits: &ResourceLimits) -> io::Result<()> {
    use nix::sched::{unshare, CloneFlags};
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(bytes) = limits.memory_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io::Error::from)?;
    }
    if let Some(secs) = limits.cpu_seconds {
        // Soft limit delivers SIGXCPU, hard limit one second later SIGKILL
        setrlimit(Resource::RLIMIT_CPU, secs, secs.saturating_add(1)).map_err(io::Error::from)?;
    }
    if limits.isolate_network {
        // Best effort: unprivileged user namespaces may be disabled
        let _ = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET);
    }
    Ok(())
}

fn spawn_fault(program: &std::path::Path, error: io::Error) -> EngineFault {
    let reason = match error.kind() {
        io::ErrorKind::NotFound => FaultReason::EngineNotFound,
        io::ErrorKind::PermissionDenied => FaultReason::PermissionDenied,
        _ => FaultReason::SpawnFailed,
    };
    EngineFault::new(reason, format!("{}: {}", program.display(), error))
}

/// Runs the configured engine against workspaces
#[derive(Debug, Clone)]
pub struct EngineInvoker {
    program: PathBuf,
    engine: EngineKind,
    limits: ResourceLimits,
    output_cap: usize,
}

impl EngineInvoker {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            engine: config.engine,
            limits: config.limits,
            output_cap: config.output_cap_bytes,
        }
    }

    /// Run the engine on `workspace`'s main document.
    ///
    /// A non-zero exit is a normal outcome. Only spawn failures and
    /// cancellation are errors.
    pub async fn invoke(
        &self,
        workspace: &Workspace,
        format: OutputFormat,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvokeError> {
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        let invocation = self.spawn(workspace, format, deadline)?;
        invocation.wait(cancel).await
    }

    fn spawn(
        &self,
        workspace: &Workspace,
        format: OutputFormat,
        deadline: Instant,
    ) -> Result<EngineInvocation, InvokeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.engine.args(MAIN_DOCUMENT, format))
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);

        for key in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        if std::env::var_os("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        cmd.env("TMPDIR", workspace.path())
            // kpathsea: no reads or writes outside the working tree
            .env("openin_any", "p")
            .env("openout_any", "p");

        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(target_os = "linux")]
        {
            let limits = self.limits;
            // SAFETY: apply_limits only issues setrlimit/unshare syscalls
            // and allocates nothing.
            unsafe {
                cmd.pre_exec(move || apply_limits(&limits));
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| InvokeError::Spawn(spawn_fault(&self.program, e)))?;
        let started = Instant::now();

        let pid = child.id();
        debug!(
            pid = ?pid,
            program = %self.program.display(),
            workspace = %workspace.path().display(),
            "Engine spawned"
        );

        let cap = self.output_cap;
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, cap)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, cap)));

        Ok(EngineInvocation {
            child,
            group: ProcessGroup::new(pid),
            started,
            deadline,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_keeps_prefix_and_counts_total() {
        let data = vec![b'x'; 20_000];
        let out = read_capped(&data[..], 100).await;

        assert_eq!(out.bytes.len(), 100);
        assert_eq!(out.total, 20_000);

        let text = out.into_text();
        assert!(text.starts_with(&"x".repeat(100)));
        assert!(text.ends_with("[output truncated: 19900 of 20000 bytes omitted]"));
    }

    #[tokio::test]
    async fn test_read_capped_under_cap_is_verbatim() {
        let out = read_capped(&b"line one\nline two\n"[..], 1024).await;
        assert_eq!(out.into_text(), "line one\nline two\n");
    }

    #[test]
    fn test_spawn_fault_classification() {
        let program = std::path::Path::new("/opt/tex/bin/pdflatex");

        let fault = spawn_fault(program, io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(fault.reason, FaultReason::EngineNotFound);
        assert!(fault.detail.contains("/opt/tex/bin/pdflatex"));

        let fault = spawn_fault(program, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(fault.reason, FaultReason::PermissionDenied);

        let fault = spawn_fault(program, io::Error::from(io::ErrorKind::Other));
        assert_eq!(fault.reason, FaultReason::SpawnFailed);
    }

    #[test]
    fn test_process_group_kills_once() {
        // A pgid that cannot exist: ESRCH is swallowed
        let mut group = ProcessGroup::new(Some(i32::MAX as u32));
        assert!(!group.kill());
        assert!(group.pgid.is_none());
        assert!(!group.kill());
    }

    #[test]
    fn test_process_group_without_pid_holds_nothing() {
        for pid in [None, Some(0), Some(u32::MAX)] {
            let mut group = ProcessGroup::new(pid);
            assert!(group.pgid.is_none(), "{:?}", pid);
            assert!(!group.kill());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_missing_binary_is_spawn_fault() {
        let root = tempfile::tempdir().unwrap();
        let manager = crate::workspace::WorkspaceManager::new(root.path());
        let ws = manager.acquire().unwrap();

        let config = CompilerConfig::for_engine(EngineKind::Generic)
            .with_program("/definitely/missing/engine")
            .with_limits(ResourceLimits::unlimited());
        let invoker = EngineInvoker::new(&config);

        let result = invoker
            .invoke(
                &ws,
                OutputFormat::Pdf,
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(InvokeError::Spawn(fault)) => assert_eq!(fault.reason, FaultReason::EngineNotFound),
            other => panic!("expected spawn fault, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_captures_exit_code_and_streams() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let script = root.path().join("engine.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"compiling $1\"\necho 'oops' >&2\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manager = crate::workspace::WorkspaceManager::new(root.path());
        let ws = manager.acquire().unwrap();
        let config = CompilerConfig::for_engine(EngineKind::Generic)
            .with_program(&script)
            .with_limits(ResourceLimits::unlimited());

        let outcome = EngineInvoker::new(&config)
            .invoke(
                &ws,
                OutputFormat::Pdf,
                Instant::now() + Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, "compiling main.tex\n");
        assert_eq!(outcome.stderr, "oops\n");
        assert!(!outcome.forced_termination);
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_deadline_forces_termination() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let script = root.path().join("engine.sh");
        std::fs::write(&script, "#!/bin/sh\necho started\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manager = crate::workspace::WorkspaceManager::new(root.path());
        let ws = manager.acquire().unwrap();
        let config = CompilerConfig::for_engine(EngineKind::Generic)
            .with_program(&script)
            .with_limits(ResourceLimits::unlimited());

        let started = std::time::Instant::now();
        let outcome = EngineInvoker::new(&config)
            .invoke(
                &ws,
                OutputFormat::Pdf,
                Instant::now() + Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(outcome.forced_termination);
        assert_eq!(outcome.signal, Some(Signal::SIGKILL as i32));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
