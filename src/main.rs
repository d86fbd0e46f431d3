//! Binary entrypoint: parse config, set up logging, wire the registry,
//! roster, and a null northbound adapter, and run the accept loop.
//!
//! Grounded on the teacher's driver binaries
//! (`netbench-driver/src/bin/netbench-driver-tcp-server.rs`): parse CLI
//! args, build the runtime pieces, hand off to a `run()` that blocks
//! forever or until a signal arrives.

use clap::Parser;
use cync_gateway::config::{Cli, Config};
use cync_gateway::metrics::Metrics;
use cync_gateway::northbound::NullAdapter;
use cync_gateway::registry::{Registry, RegistryConfig};
use cync_gateway::roster::DeviceRoster;
use cync_gateway::server::Server;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::resolve(cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let roster = match &config.device_roster_path {
        Some(path) => Arc::new(DeviceRoster::load(path)?),
        None => {
            tracing::warn!("no device_roster_path configured, dispatch will refuse every command");
            Arc::new(DeviceRoster::empty())
        }
    };

    let registry = Arc::new(Registry::new(RegistryConfig {
        max_connections: config.max_connections,
        ip_whitelist: config.tcp_whitelist.clone(),
    }));
    let metrics = Metrics::new();
    let northbound = Arc::new(NullAdapter);
    let config = Arc::new(config);

    let server = Server::new(config, registry, roster, metrics, northbound)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
