use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::QuotagateConfig;
use quotagate::ratelimit::{
    Decision, LimiterEngine, Maintenance, Outcome, OutcomeKind, PolicyRegistry, PolicyTable,
    RejectReason,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Admission control engine reading JSON requests from stdin.
#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about)]
struct Args {
    /// Engine configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy table, overriding `policies_path` from the configuration
    #[arg(short, long)]
    policies: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<serde_json::Value>,
    client: String,
    endpoint: String,
    #[serde(default = "default_cost")]
    cost: u64,
}

fn default_cost() -> u64 {
    1
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<serde_json::Value>,
    outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
    remaining: u64,
    retry_after_ms: u64,
}

impl Response {
    fn new(id: Option<serde_json::Value>, decision: &Decision) -> Self {
        Self {
            id,
            outcome: decision.kind(),
            reason: decision.reject_reason(),
            remaining: decision.remaining,
            retry_after_ms: decision.retry_after_millis(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; logs go to stderr so stdout carries only decisions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    info!("Starting Quotagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => QuotagateConfig::from_file(path)?,
        None => QuotagateConfig::default(),
    };

    let policies_path = args
        .policies
        .or_else(|| config.policies_path.as_ref().map(PathBuf::from))
        .context("no policy table given; pass --policies or set policies_path")?;
    let table = PolicyTable::from_file(&policies_path)
        .with_context(|| format!("loading policies from {}", policies_path.display()))?;
    let registry = PolicyRegistry::from_table(&table, config.engine.idle_ttl_multiplier)?;
    info!(
        policies = registry.len(),
        path = %policies_path.display(),
        "Policies loaded"
    );

    let engine = Arc::new(LimiterEngine::new(registry, &config.engine));
    let maintenance = Maintenance::spawn(engine.clone(), &config.maintenance);

    tokio::select! {
        result = serve(engine) => {
            result?;
            info!("Input closed");
        }
        _ = shutdown_signal() => {}
    }

    maintenance.shutdown().await;
    info!("Quotagate stopped");
    Ok(())
}

/// Answer requests from stdin until it closes.
async fn serve(engine: Arc<LimiterEngine>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Skipping malformed request");
                continue;
            }
        };

        let decision = engine.decide_now(&request.client, &request.endpoint, request.cost);
        match decision.outcome {
            Outcome::Queued(ticket) => {
                debug!(
                    client = %request.client,
                    position = ticket.position(),
                    "Request queued"
                );
                let tx = tx.clone();
                tokio::spawn(async move {
                    let decision = ticket.wait().await;
                    let _ = tx.send(Response::new(request.id, &decision));
                });
            }
            _ => {
                let _ = tx.send(Response::new(request.id, &decision));
            }
        }
    }

    // Pending waiters hold their own senders and finish before the writer does
    drop(tx);
    writer.await??;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
