//! Proxy configuration.
//!
//! # Hierarchy
//!
//! 1. Built-in defaults
//! 2. Environment variables (`GATE_*`)
//! 3. CLI flags (applied by the `gate-proxy` binary, highest precedence)

use std::path::PathBuf;

use crate::client::BrokerEndpoint;

/// Default absolute cap on how long the proxy will ask the broker to let a
/// lock be held; mirrors the broker's own default (§6).
pub const DEFAULT_MAX_HOLD_MS: u64 = 3_600_000;

/// Default bound on how long an `acquire` blocks before the proxy surfaces
/// a timeout to the calling syscall.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

/// Runtime configuration for the filesystem proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub root: PathBuf,
    pub mount: PathBuf,
    pub broker_endpoint: BrokerEndpoint,
    pub max_hold_ms: u64,
    pub acquire_timeout_ms: u64,
    /// Legacy policy: release the write lock on flush rather than on
    /// handle close. Selected by `GATE_RELEASE_ON_FLUSH=1`.
    pub release_on_flush: bool,
    pub allow_other: bool,
    pub foreground: bool,
}

impl ProxyConfig {
    /// `lease_ms / 3` is this workspace's heartbeat cadence rule (§4.2); the
    /// proxy doesn't know `lease_ms` directly, so the binary derives this
    /// from whatever lease window it was configured with.
    #[must_use]
    pub const fn heartbeat_interval_ms(lease_ms: u64) -> u64 {
        lease_ms / 3
    }

    /// Read the `GATE_RELEASE_ON_FLUSH` legacy toggle from the environment.
    #[must_use]
    pub fn release_on_flush_from_env() -> bool {
        std::env::var("GATE_RELEASE_ON_FLUSH").as_deref() == Ok("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn flush_release_is_opt_in() {
        std::env::remove_var("GATE_RELEASE_ON_FLUSH");
        assert!(!ProxyConfig::release_on_flush_from_env());
        std::env::set_var("GATE_RELEASE_ON_FLUSH", "1");
        assert!(ProxyConfig::release_on_flush_from_env());
        std::env::remove_var("GATE_RELEASE_ON_FLUSH");
    }

    #[test]
    fn heartbeat_interval_is_a_third_of_the_lease() {
        assert_eq!(ProxyConfig::heartbeat_interval_ms(300_000), 100_000);
    }
}
