//! Standalone lock broker daemon.

mod cli;
mod transport;

use std::path::PathBuf;

use clap::Parser;
use gate_broker_core::{Broker, BrokerConfig};

use cli::Args;
use transport::Endpoint;

fn default_state_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "gate", "gate-broker")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/var/lib/gate-broker"))
}

fn resolve_config(args: &Args) -> anyhow::Result<BrokerConfig> {
    let mut config = BrokerConfig::from_env(default_state_dir())?;
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(lease_ms) = args.lease_ms {
        config.lease_ms = lease_ms;
    }
    if let Some(max_hold_ms) = args.max_hold_ms {
        config.max_hold_ms = max_hold_ms;
    }
    if let Some(acquire_timeout_ms) = args.acquire_timeout_ms {
        config.acquire_timeout_ms = acquire_timeout_ms;
    }
    Ok(config)
}

fn resolve_endpoint(args: &Args, state_dir: &std::path::Path) -> Endpoint {
    if let Some(host) = args.host.clone().or_else(|| std::env::var("GATE_BROKER_HOST").ok()) {
        let port = args
            .port
            .or_else(|| std::env::var("GATE_BROKER_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(7890);
        return Endpoint::Tcp { host, port };
    }
    let socket = args.socket.clone().unwrap_or_else(|| state_dir.join("gate.sock"));
    Endpoint::Unix(socket)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = resolve_config(&args)?;
    let endpoint = resolve_endpoint(&args, &config.state_dir);

    let broker = Broker::open(config).await?;

    let sweeper = tokio::spawn(gate_broker_core::sweep::run_sweep_loop(broker.clone()));
    let server = tokio::spawn(transport::serve(endpoint, broker));

    tokio::select! {
        result = server => result??,
        _ = sweeper => {},
    }
    Ok(())
}
