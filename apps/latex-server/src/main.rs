//! LaTeX Compilation Server
//!
//! Compiles untrusted LaTeX into PDF behind a REST API. Provides endpoints
//! for:
//!
//! - Raw source compilation with auxiliary files
//! - Structured JSON document rendering
//! - Health and capacity reporting
//!
//! ## Architecture
//!
//! Every request is handed to a shared `latex_engine::Compiler`, which bounds
//! concurrency, isolates each run in its own workspace and classifies the
//! outcome. This binary adds:
//!
//! - Rate limiting via tower-governor
//! - Environment and `.env` configuration
//! - Cancellation of in-flight compilations on shutdown

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::{Parser, ValueEnum};
use latex_engine::{
    CancellationToken, Compiler, CompilerConfig, EngineKind, GatePolicy, ResourceLimits,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod error;

use api::{handle_compile, handle_health, handle_render, handle_render_tex};

/// Headroom on top of the encoded input for JSON framing
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Encoded bytes allowed per input byte: base64 needs 4/3, escaped backslashes 2
const BODY_EXPANSION: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Wait for a free slot
    Queue,
    /// Fail fast with 503
    Reject,
}

/// Command-line arguments for the LaTeX server
#[derive(Parser, Debug)]
#[command(name = "latex-server")]
#[command(about = "Sandboxed LaTeX compilation server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Rate limit: requests per second per IP
    #[arg(long, env = "RATE_LIMIT", default_value = "10")]
    rate_limit: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Engine family (tectonic, pdflatex, generic)
    #[arg(long, env = "LATEX_ENGINE", default_value = "tectonic")]
    engine: EngineKind,

    /// Engine binary; defaults to the engine name looked up on PATH
    #[arg(long, env = "LATEX_ENGINE_PATH")]
    engine_path: Option<PathBuf>,

    /// Maximum simultaneous compilations
    #[arg(long, env = "LATEX_MAX_CONCURRENT", default_value = "4")]
    max_concurrent: usize,

    /// Behaviour when every compilation slot is busy
    #[arg(long, env = "LATEX_GATE_POLICY", value_enum, default_value = "queue")]
    gate_policy: PolicyArg,

    /// Longest wait for a slot under the queue policy (0 = unbounded)
    #[arg(long, env = "LATEX_QUEUE_WAIT_MS", default_value = "30000")]
    queue_wait_ms: u64,

    /// Default compilation timeout in milliseconds
    #[arg(long, env = "LATEX_TIMEOUT_MS", default_value = "30000")]
    timeout_ms: u64,

    /// Upper bound for per-request timeout overrides
    #[arg(long, env = "LATEX_MAX_TIMEOUT_MS", default_value = "120000")]
    max_timeout_ms: u64,

    /// Bytes of engine output kept per stream
    #[arg(long, env = "LATEX_OUTPUT_CAP_BYTES", default_value = "262144")]
    output_cap_bytes: usize,

    /// Maximum decoded request payload (source plus files)
    #[arg(long, env = "LATEX_MAX_INPUT_BYTES", default_value = "10485760")]
    max_input_bytes: usize,

    /// Engine address-space cap in MiB (0 = unlimited)
    #[arg(long, env = "LATEX_MEMORY_LIMIT_MB", default_value = "1024")]
    memory_limit_mb: u64,

    /// Engine CPU-time cap in seconds (0 = unlimited)
    #[arg(long, env = "LATEX_CPU_LIMIT_SECS", default_value = "60")]
    cpu_limit_secs: u64,

    /// Run the engine without network access where the host allows it
    #[arg(long, env = "LATEX_ISOLATE_NETWORK", default_value = "true", action = clap::ArgAction::Set)]
    isolate_network: bool,

    /// Directory for per-request workspaces
    #[arg(long, env = "LATEX_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Extra regex marking engine warning lines (repeatable)
    #[arg(long, env = "LATEX_WARNING_PATTERN", value_delimiter = ';')]
    warning_pattern: Vec<String>,

    /// Extra regex marking engine error lines (repeatable)
    #[arg(long, env = "LATEX_ERROR_PATTERN", value_delimiter = ';')]
    error_pattern: Vec<String>,
}

impl Args {
    fn compiler_config(&self) -> CompilerConfig {
        let gate_policy = match self.gate_policy {
            PolicyArg::Reject => GatePolicy::Reject,
            PolicyArg::Queue => GatePolicy::Queue {
                max_wait: (self.queue_wait_ms > 0)
                    .then(|| Duration::from_millis(self.queue_wait_ms)),
            },
        };

        let limits = ResourceLimits {
            memory_bytes: (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024),
            cpu_seconds: (self.cpu_limit_secs > 0).then_some(self.cpu_limit_secs),
            isolate_network: self.isolate_network,
        };

        let mut config = CompilerConfig::for_engine(self.engine)
            .with_capacity(self.max_concurrent)
            .with_gate_policy(gate_policy)
            .with_max_timeout(Duration::from_millis(self.max_timeout_ms))
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_output_cap(self.output_cap_bytes)
            .with_max_input(self.max_input_bytes)
            .with_limits(limits);

        if let Some(program) = &self.engine_path {
            config = config.with_program(program);
        }
        if let Some(root) = &self.workspace_root {
            config = config.with_workspace_root(root);
        }
        for pattern in &self.warning_pattern {
            config = config.with_warning_pattern(pattern);
        }
        for pattern in &self.error_pattern {
            config = config.with_error_pattern(pattern);
        }
        config
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub compiler: Arc<Compiler>,
    /// Cancelled on shutdown; every compilation runs under a child token
    pub shutdown: CancellationToken,
}

/// Routes and middleware shared by the binary and the endpoint tests
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .compiler
        .config()
        .max_input_bytes
        .saturating_mul(BODY_EXPANSION)
        .saturating_add(BODY_OVERHEAD_BYTES);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handle_health))
        // API endpoints
        .route("/api/compile", post(handle_compile))
        .route("/api/render", post(handle_render))
        .route("/api/render/tex", post(handle_render_tex))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LaTeX server on {}:{}", args.host, args.port);

    let compiler = Compiler::new(args.compiler_config()).context("invalid compiler configuration")?;
    info!(
        engine = %compiler.config().engine,
        program = %compiler.config().program.display(),
        capacity = compiler.config().capacity,
        "Compiler ready"
    );
    if !compiler.config().limits.isolate_network {
        warn!("Network isolation disabled; engine runs can reach the network");
    }

    // Create rate limiter configuration
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(args.rate_limit.into())
            .burst_size(args.rate_limit.saturating_mul(2))
            .finish()
            .context("invalid rate limiter configuration")?,
    );

    let shutdown = CancellationToken::new();
    let state = AppState {
        compiler: Arc::new(compiler),
        shutdown: shutdown.clone(),
    };

    let app = build_router(state).layer(GovernorLayer {
        config: governor_conf,
    });

    // Start server
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Rate limit: {} requests/second per IP", args.rate_limit);
    info!("Default timeout: {}ms", args.timeout_ms);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, cancelling every in-flight compilation first
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, cancelling in-flight compilations");
    shutdown.cancel();
}
