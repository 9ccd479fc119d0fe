//! # Gbridge Entry Point
//!
//! The main executable of the bridge. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and sets up logging.
//! 2. **Connection**: Connects to the backend through `gbridge_core`.
//! 3. **Serving**: Exposes the backend over HTTP until Ctrl-C or SIGTERM.
mod cli;
mod logging;
mod server;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use gbridge_core::engine::InvocationEngine;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose);

    let grpc_addr = cli.grpc_uri();
    tracing::info!(%grpc_addr, "connecting to backend");

    let engine = InvocationEngine::connect(&grpc_addr, cli.connect_timeout, cli.engine_options())
        .await
        .with_context(|| format!("Failed to connect to gRPC backend at {grpc_addr}"))?;

    let state = server::AppState::new(engine, grpc_addr, cli.request_timeout);

    let listener = TcpListener::bind((cli.http_addr.as_str(), cli.http_port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", cli.http_addr, cli.http_port))?;
    tracing::info!(addr = %listener.local_addr()?, "gbridge listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("gbridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
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

    tracing::info!("shutdown signal received, draining connections");
}
