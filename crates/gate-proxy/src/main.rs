//! FUSE filesystem proxy daemon.

mod cli;
mod filesystem;
mod inode;

use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use gate_proxy_core::{BrokerClient, BrokerEndpoint, HandleTable, ProxyConfig};

use cli::Args;
use filesystem::GateFs;

const DEFAULT_LEASE_MS: u64 = 300_000;
const DEFAULT_MAX_HOLD_MS: u64 = 3_600_000;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn resolve_endpoint(args: &Args) -> anyhow::Result<BrokerEndpoint> {
    if let (Some(host), Some(port)) = (args.broker_host.clone(), args.broker_port) {
        return Ok(BrokerEndpoint::Tcp { host, port });
    }
    if let Some(socket) = args.broker_socket.clone() {
        return Ok(BrokerEndpoint::Unix(socket));
    }
    if let Ok(socket) = std::env::var("GATE_BROKER_SOCKET") {
        return Ok(BrokerEndpoint::Unix(socket.into()));
    }
    anyhow::bail!("either --broker-socket or --broker-host/--broker-port must be given")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let endpoint = resolve_endpoint(&args)?;

    let config = ProxyConfig {
        root: args.root.canonicalize()?,
        mount: args.mount.clone(),
        broker_endpoint: endpoint.clone(),
        max_hold_ms: args.max_hold_ms.unwrap_or_else(|| env_u64("GATE_MAX_HOLD_MS", DEFAULT_MAX_HOLD_MS)),
        acquire_timeout_ms: args
            .acquire_timeout_ms
            .unwrap_or_else(|| env_u64("GATE_ACQUIRE_TIMEOUT_MS", DEFAULT_ACQUIRE_TIMEOUT_MS)),
        release_on_flush: ProxyConfig::release_on_flush_from_env(),
        allow_other: args.allow_other,
        foreground: args.foreground,
    };
    let lease_ms = args.lease_ms.unwrap_or_else(|| env_u64("GATE_LEASE_MS", DEFAULT_LEASE_MS));

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let rt_handle = runtime.handle().clone();

    let broker = Arc::new(BrokerClient::new(endpoint));
    let handles = Arc::new(HandleTable::new());

    let heartbeat_interval = std::time::Duration::from_millis(ProxyConfig::heartbeat_interval_ms(lease_ms).max(1000));
    runtime.spawn(gate_proxy_core::handle::run_heartbeat_loop(
        Arc::clone(&broker),
        Arc::clone(&handles),
        heartbeat_interval,
    ));

    let mut mount_options = vec![MountOption::FSName("gate".to_string())];
    if config.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    let fs = GateFs::new(config.clone(), broker, handles, rt_handle);

    tracing::info!(root = %config.root.display(), mount = %config.mount.display(), "mounting");
    fuser::mount2(fs, &config.mount, &mount_options)?;
    Ok(())
}
