//! Command-line surface for the filesystem proxy.

use std::path::PathBuf;

use clap::Parser;

/// FUSE filesystem proxy: mirrors a backing directory tree, routing every
/// access through the lock broker before touching the underlying files.
#[derive(Debug, Parser)]
#[command(name = "gate-proxy", version, about)]
pub struct Args {
    /// Directory tree to mirror.
    #[arg(long, value_name = "PATH")]
    pub root: PathBuf,

    /// Where to mount the mirrored view.
    #[arg(long, value_name = "PATH")]
    pub mount: PathBuf,

    /// Connect to the broker over TCP at this host instead of a
    /// Unix-domain socket. Must be paired with `--broker-port`.
    #[arg(long, value_name = "HOST", requires = "broker_port", conflicts_with = "broker_socket")]
    pub broker_host: Option<String>,

    /// TCP port to use when `--broker-host` is given.
    #[arg(long, value_name = "PORT")]
    pub broker_port: Option<u16>,

    /// Connect to the broker over a Unix-domain socket at this path.
    #[arg(long, value_name = "PATH", conflicts_with = "broker_host")]
    pub broker_socket: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(long)]
    pub foreground: bool,

    /// Allow other users to access the mount (requires `user_allow_other`
    /// in `/etc/fuse.conf`).
    #[arg(long)]
    pub allow_other: bool,

    /// Absolute cap in milliseconds on how long any lock this proxy
    /// requests may stay granted. Falls back to `GATE_MAX_HOLD_MS`.
    #[arg(long, value_name = "MS")]
    pub max_hold_ms: Option<u64>,

    /// How long an `acquire` blocks before surfacing a timeout to the
    /// calling syscall. Falls back to `GATE_ACQUIRE_TIMEOUT_MS`.
    #[arg(long, value_name = "MS")]
    pub acquire_timeout_ms: Option<u64>,

    /// Lease window this proxy assumes the broker is using, purely to size
    /// its own heartbeat cadence (`lease_ms / 3`). Falls back to
    /// `GATE_LEASE_MS`.
    #[arg(long, value_name = "MS")]
    pub lease_ms: Option<u64>,
}
