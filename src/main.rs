//! Standalone rewriting proxy.
//!
//! Usage: `rewrite-proxy [config.toml]`. Without a file every setting
//! takes its default.

use std::path::Path;
use std::sync::Arc;

use rewrite_proxy::config::{load_config, ProxyConfig};
use rewrite_proxy::lifecycle::{spawn_signal_handler, Shutdown};
use rewrite_proxy::observability::{logging, metrics};
use rewrite_proxy::{PassthroughProcessor, ProxyServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(Path::new(&path))?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("rewrite-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = ProxyServer::bind(config, Arc::new(PassthroughProcessor)).await?;
    tracing::info!(
        same_origin = %server.same_origin_addr()?,
        cross_origin = %server.cross_origin_addr()?,
        "Listening for connections"
    );

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());
    server.run(shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
