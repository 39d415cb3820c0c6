//! web3chat relay daemon.
//!
//! Stores end-to-end encrypted envelopes and serves them back to either
//! party over HTTP. Plaintext never reaches this process.
//!
//! ```bash
//! RUST_LOG=debug cargo run -p web3chat-server -- --db chat.db --bind 0.0.0.0:3001
//! ```

mod config;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use web3chat_core::MessageStore;

use config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    tracing::info!(bind = %args.bind, memory = args.memory, "web3chat-server starting");

    let store = Arc::new(
        MessageStore::from_config(&args.store_config()).context("failed to open message store")?,
    );
    store
        .connect(&args.service_identity)
        .await
        .context("failed to establish relay session")?;

    let app = routes::router(Arc::clone(&store));
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    tracing::info!("listening on http://{}", args.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    store.close();
    tracing::info!("web3chat-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
