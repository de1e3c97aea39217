//! CLI entry point: parses flags, loads the policy, starts the metrics
//! HTTP endpoint, and runs the pipeline until SIGINT/SIGTERM or EOF.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use audit_filter_core::decoder::DecoderConfig;
use audit_filter_core::defaults::{DEFAULT_INPUT_PATHS, DEFAULT_METRICS_ADDR, DEFAULT_POLICY_PATH};
use audit_filter_core::metrics::Metrics;
use audit_filter_core::pipeline::{run_to_stdout, PipelineConfig};
use audit_filter_core::policy_loader::{load_initial, spawn_watcher, PolicyHandle};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Streaming filter for Kubernetes-style API server audit logs: tails,
/// reorders, denoises, deduplicates, and re-emits NDJSON on stdout.
#[derive(Parser, Debug)]
#[command(name = "audit-filter")]
#[command(about = "Tails, filters, and deduplicates Kubernetes-style audit logs")]
struct Args {
    /// Audit log file to tail. Repeatable; defaults to the usual
    /// kube/openshift/oauth apiserver paths.
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,

    /// Path to the filter policy YAML file.
    #[arg(long, default_value = DEFAULT_POLICY_PATH)]
    policy: PathBuf,

    /// Follow and reopen files when rotated (tail -F).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    follow: bool,

    /// Deduplicate repeated no-op update requests.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    dedupe: bool,

    /// Emit only dropped events, for testing a policy.
    #[arg(long, default_value_t = false)]
    invert: bool,

    /// Number of decode workers; defaults to `1 + numCPU`.
    #[arg(long)]
    workers: Option<usize>,

    /// Print metrics to stderr at exit.
    #[arg(long, default_value_t = false)]
    print_metrics: bool,

    /// Address the Prometheus `/metrics` and `/healthz` endpoints listen on.
    #[arg(long, default_value = DEFAULT_METRICS_ADDR)]
    metrics_addr: String,
}

#[derive(Clone)]
struct HttpState {
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let inputs = if args.inputs.is_empty() {
        DEFAULT_INPUT_PATHS.iter().map(PathBuf::from).collect()
    } else {
        args.inputs.clone()
    };
    let workers = args.workers.unwrap_or_else(DecoderConfig::default_worker_count);

    let (initial_policy, load_err) = load_initial(&args.policy);
    if let Some(e) = load_err {
        warn!(path = %args.policy.display(), error = %e, "policy file unusable, falling back to built-in default policy");
    }
    let policy_handle = PolicyHandle::new(initial_policy);
    let mut watcher_handle = None;
    if args.follow {
        match spawn_watcher(args.policy.clone(), policy_handle.clone()) {
            Ok(handle) => watcher_handle = Some(handle),
            Err(e) => warn!(path = %args.policy.display(), error = %e, "policy hot-reload disabled, watcher init failed"),
        }
    }

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    let http_state = HttpState { metrics: metrics.clone() };
    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(http_state);
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics address {}", args.metrics_addr))?;
    info!(addr = %args.metrics_addr, "metrics endpoint listening");
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, app).await {
            error!(error = %e, "metrics HTTP server exited");
        }
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining pipeline");
        signal_shutdown.store(true, Ordering::Relaxed);
    });

    let pipeline_config = PipelineConfig {
        inputs,
        follow: args.follow,
        dedupe: args.dedupe,
        invert: args.invert,
        workers,
        dedup_cache_capacity: audit_filter_core::dedup::DEFAULT_CACHE_CAPACITY,
    };
    run_to_stdout(pipeline_config, policy_handle, metrics.clone(), shutdown).await;

    http_handle.abort();
    if let Some(handle) = watcher_handle {
        handle.abort();
    }

    if args.print_metrics {
        metrics.print();
    }

    Ok(())
}

async fn serve_metrics(State(state): State<HttpState>) -> Result<String, StatusCode> {
    state.metrics.encode().map_err(|e| {
        error!(error = %e, "metrics encode failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
