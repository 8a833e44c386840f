use std::path::PathBuf;

use anyhow::Context as _;
use devproxy_core::{config::ProxyConfig, server::Server};
use tracing::{error, info, instrument};

mod logging;

const DEFAULT_CONFIG: &str = "devproxy.yaml";

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init_logging_from_env() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let server = match startup().await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start devproxy: {:#}", e);
            std::process::exit(1);
        }
    };

    run_server(server).await;
}

#[instrument(name = "devproxy_startup")]
async fn startup() -> anyhow::Result<Server> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    info!("Loading config from {}", config_path.display());

    let config = ProxyConfig::load(&config_path)
        .with_context(|| format!("Invalid config {}", config_path.display()))?;

    for (prefix, entry) in config.proxy.iter() {
        info!("Proxying {} -> {}", prefix, entry.options().target);
    }

    let server = Server::from_config(&config).await?;
    info!("Listening on http://{}", server.local_addr()?);

    Ok(server)
}

#[instrument(skip(server))]
async fn run_server(server: Server) {
    server.run().await;
}
