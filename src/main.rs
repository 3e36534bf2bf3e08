//! turnstile: cluster-coordinated rate limiter node.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 failure to reach
//! initial discovery, 3 unrecoverable runtime error.

use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::BootstrapError;
use turnstile::Config;
use turnstile::Node;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return 1;
        }
    };

    let node = match Node::bootstrap(config).await {
        Ok(node) => node,
        Err(err @ BootstrapError::Config(_)) => {
            error!(error = %err, "configuration error");
            return 1;
        }
        Err(err @ BootstrapError::Discovery(_)) => {
            error!(error = %err, "failed to reach initial discovery");
            return 2;
        }
        Err(err @ BootstrapError::Runtime(_)) => {
            error!(error = %err, "unrecoverable startup error");
            return 3;
        }
    };

    match node.serve().await {
        Ok(()) => {
            info!("clean shutdown");
            0
        }
        Err(err) => {
            error!(error = %err, "unrecoverable runtime error");
            3
        }
    }
}
