// FILE: src/main.rs
mod config;
mod error;
mod events;
mod tools;
mod utils;
mod web;

use crate::config::Config;
use crate::web::handler::{build_router, AppManagers, AppState};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("jury_runner={},tower_http={}", level, level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

fn check_program(program: &str, purpose: &str) {
    if which::which(program).is_err() {
        tracing::warn!(program, "{} program is not installed or not in PATH; {} will fail at runtime.", program, purpose);
    }
}

/// Waits for Ctrl-C, then stops all runs and sessions so open event streams end.
async fn shutdown_signal(managers: Arc<AppManagers>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    managers.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load().context("Failed to load configuration")?);
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting jury-runner server");
    tracing::debug!("Loaded configuration: {:?}", config);

    check_program(&config.deliberation_program, "deliberation runs");
    check_program(&config.generator_program, "juror generation sessions");

    let managers = Arc::new(AppManagers::new(config.clone()).context("Failed to initialise managers")?);
    let app = build_router(AppState::new(managers.clone()));

    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, upload_root = %config.upload_root.display(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(managers.clone()))
        .await
        .context("Server terminated with error")?;

    if config.upload_root_is_temp {
        if let Err(e) = tokio::fs::remove_dir_all(&config.upload_root).await {
            tracing::warn!(path = %config.upload_root.display(), error = %e, "Failed to remove temporary upload root");
        }
    }

    tracing::info!("Server shutdown.");
    Ok(())
}
