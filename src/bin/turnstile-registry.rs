//! Standalone discovery registry for turnstile clusters.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 3 unrecoverable
//! runtime error.

use std::sync::Arc;

use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::loader::EnvLoader;
use turnstile::constants::DEFAULT_REGISTRY_TTL_MS;
use turnstile::registry::RegistryState;
use turnstile::registry::build_registry_router;
use turnstile::time::SystemTimeProvider;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let port = u16::from_env_or_default("TURNSTILE_REGISTRY_PORT", 7060);
    let ttl_ms = u64::from_env_or_default("TURNSTILE_REGISTRY_TTL_MS", DEFAULT_REGISTRY_TTL_MS);
    if ttl_ms == 0 {
        error!("TURNSTILE_REGISTRY_TTL_MS must be positive");
        return 1;
    }

    let state = RegistryState::new(ttl_ms, Arc::new(SystemTimeProvider));
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port, "failed to bind registry port");
            return 3;
        }
    };
    info!(port, ttl_ms, "registry listening");

    let served = axum::serve(listener, build_registry_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;

    match served {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "registry failed");
            3
        }
    }
}
