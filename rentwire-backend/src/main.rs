//! `RentWire` development backend.
//!
//! An axum WebSocket server speaking the `RentWire` event protocol, for local
//! development and end-to-end testing of clients.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000, accepting any token
//! cargo run --bin rentwire-backend
//!
//! # Only accept two tokens, on a custom address
//! cargo run --bin rentwire-backend -- --bind 127.0.0.1:8080 \
//!     --allow-token alice --allow-token bob
//! ```

use std::sync::Arc;

use clap::Parser;
use rentwire_backend::config::{BackendCliArgs, BackendConfig};
use rentwire_backend::server;

#[tokio::main]
async fn main() {
    let cli = BackendCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match BackendConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting rentwire backend");

    if !config.allowed_tokens.is_empty() {
        tracing::info!(count = config.allowed_tokens.len(), "token allow-list enabled");
    }
    tracing::debug!(
        auth_timeout_secs = config.settings.auth_timeout.as_secs(),
        max_frame_size = config.settings.max_frame_size,
        "connection limits"
    );
    let state = Arc::new(config.build_state());

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "backend listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "backend server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start backend");
            std::process::exit(1);
        }
    }
}
