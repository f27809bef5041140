mod cli;
mod config;
mod context;
mod coordinator;
mod error;
mod groups;
mod http;
mod k8s;
mod model;
mod rollout;
mod runner;
mod sections;
mod stream;

use anyhow::{Context, Result};
use clap::Parser;
use cli::CliArgs;
use config::ServerConfig;
use http::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Execution contexts are process-wide, so every task shares one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let config = ServerConfig::resolve(&args)?;
    if let Some(source) = &config.source {
        info!(source, "loaded config");
    }
    let bind = config.bind;
    let executable = config.executable.clone();

    let state = Arc::new(AppState::from_config(config));
    let app = http::create_app(state);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, executable, "kubecmds listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")?;

    info!("kubecmds stopped");
    Ok(())
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {error}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
