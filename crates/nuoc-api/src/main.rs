//! nuoc CLI and HTTP server entry point.
//!
//! Binary name: `nuoc`
//!
//! Loads the engine configuration, initializes tracing and the journal
//! database, then dispatches to a command or runs the server.

mod cli;
mod http;
mod state;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use nuoc_infra::config::load_engine_config;
use nuoc_observe::tracing_setup::{init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_engine_config(cli.config.as_deref()).await?;
    init_tracing(&config.logging).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(config).await?;
    let result = dispatch(&state, cli).await;

    shutdown_tracing();
    result
}

async fn dispatch(state: &AppState, cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { bind } => serve(state, bind).await,
        Commands::Resolve { id, payload } => {
            cli::awakeable::resolve(state, &id, payload.as_deref(), cli.json).await
        }
        Commands::Reject { id, reason } => cli::awakeable::reject(state, &id, &reason, cli.json).await,
        Commands::Submit { file, wait } => cli::job::submit(state, &file, wait, cli.json).await,
        Commands::Status { job_id } => cli::job::status(state, &job_id, cli.json).await,
        Commands::Cancel { job_id } => cli::job::cancel(state, &job_id, cli.json).await,
    }
}

/// Run the engine driver and the HTTP API until Ctrl+C or SIGTERM.
///
/// Jobs left running by a previous process are resumed by the driver's
/// first tick. Jobs still in flight at shutdown are resumed the same way
/// by the next process.
async fn serve(state: &AppState, bind: Option<String>) -> anyhow::Result<()> {
    let addr = bind.unwrap_or_else(|| state.config.http.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    let driver = state.driver();
    let driver_token = shutdown.clone();
    let driver_task = tokio::spawn(async move { driver.run_until_cancelled(driver_token).await });

    tracing::info!(%addr, "nuoc listening");
    println!("nuoc listening on http://{addr}");

    let router = http::router::build_router(state.clone());
    let server_token = shutdown.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_token.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(e) = driver_task.await {
        tracing::error!(error = %e, "engine driver task failed");
    }
    state.store.pool().close().await;
    served.context("HTTP server error")?;

    println!("Server stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
