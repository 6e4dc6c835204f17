//! Command-line surface for the broker daemon.

use std::path::PathBuf;

use clap::Parser;

/// Standalone lock broker: owns the durable FIFO queue and serves
/// acquire/release/heartbeat/status requests from one or more proxies.
#[derive(Debug, Parser)]
#[command(name = "gate-broker", version, about)]
pub struct Args {
    /// Directory holding the broker's durable state (`gate.db`). Falls back
    /// to `GATE_STATE_DIR`, then to the platform data directory.
    #[arg(long, value_name = "PATH")]
    pub state_dir: Option<PathBuf>,

    /// Bind a TCP loopback listener on this host instead of a Unix-domain
    /// socket. Must be paired with `--port`.
    #[arg(long, value_name = "HOST", conflicts_with = "socket")]
    pub host: Option<String>,

    /// TCP port to bind when `--host` is given.
    #[arg(long, value_name = "PORT", requires = "host")]
    pub port: Option<u16>,

    /// Bind a Unix-domain socket at this path. Default transport.
    #[arg(long, value_name = "PATH", conflicts_with = "host")]
    pub socket: Option<PathBuf>,

    /// Lease window in milliseconds: a granted lock with no heartbeat for
    /// longer than this is reclaimed. Falls back to `GATE_LEASE_MS`.
    #[arg(long, value_name = "MS")]
    pub lease_ms: Option<u64>,

    /// Absolute cap in milliseconds on how long any lock may stay granted,
    /// regardless of heartbeats. Falls back to `GATE_MAX_HOLD_MS`.
    #[arg(long, value_name = "MS")]
    pub max_hold_ms: Option<u64>,

    /// How long, in milliseconds, an `acquire` call blocks before returning
    /// a timeout. Falls back to `GATE_ACQUIRE_TIMEOUT_MS`.
    #[arg(long, value_name = "MS")]
    pub acquire_timeout_ms: Option<u64>,
}
