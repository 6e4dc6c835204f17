//! Broker configuration.
//!
//! # Hierarchy
//!
//! 1. Built-in defaults
//! 2. Environment variables (`GATE_*`)
//! 3. CLI flags (applied by the `gate-broker` binary, highest precedence)

use std::path::PathBuf;

use crate::error::StoreError;

/// Default lease window: a granted entry with no heartbeat for longer than
/// this is reclaimed by the sweep.
pub const DEFAULT_LEASE_MS: u64 = 300_000;

/// Default absolute cap on how long any entry may stay granted.
pub const DEFAULT_MAX_HOLD_MS: u64 = 3_600_000;

/// Default bound on how long a client will wait for `acquire` to resolve.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

/// Runtime configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub state_dir: PathBuf,
    pub lease_ms: u64,
    pub max_hold_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl BrokerConfig {
    /// Start from built-in defaults, then apply `GATE_*` environment
    /// overrides. `state_dir` has no built-in default; callers (the CLI)
    /// must supply one, either from `--state-dir` or from this env layer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StateDir`] if `GATE_STATE_DIR` is set but
    /// empty, or if a duration override fails to parse or is non-positive.
    pub fn from_env(default_state_dir: PathBuf) -> Result<Self, StoreError> {
        let state_dir = match std::env::var("GATE_STATE_DIR") {
            Ok(v) if v.trim().is_empty() => {
                return Err(StoreError::StateDir("GATE_STATE_DIR is set but empty".into()));
            }
            Ok(v) => PathBuf::from(v),
            Err(_) => default_state_dir,
        };

        let lease_ms = parse_positive_env("GATE_LEASE_MS", DEFAULT_LEASE_MS)?;
        let max_hold_ms = parse_positive_env("GATE_MAX_HOLD_MS", DEFAULT_MAX_HOLD_MS)?;
        let acquire_timeout_ms = parse_positive_env("GATE_ACQUIRE_TIMEOUT_MS", DEFAULT_ACQUIRE_TIMEOUT_MS)?;

        Ok(Self {
            state_dir,
            lease_ms,
            max_hold_ms,
            acquire_timeout_ms,
        })
    }

    /// Path to the SQLite database file under `state_dir`.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("gate.db")
    }
}

fn parse_positive_env(var: &str, default: u64) -> Result<u64, StoreError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(v) => {
            let parsed: u64 = v.trim().parse().map_err(|_| {
                StoreError::StateDir(format!("{var}={v} is not a valid positive integer"))
            })?;
            if parsed == 0 {
                return Err(StoreError::StateDir(format!("{var} must be positive, got 0")));
            }
            Ok(parsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_when_env_unset() {
        std::env::remove_var("GATE_LEASE_MS");
        std::env::remove_var("GATE_MAX_HOLD_MS");
        std::env::remove_var("GATE_ACQUIRE_TIMEOUT_MS");
        std::env::remove_var("GATE_STATE_DIR");
        let cfg = BrokerConfig::from_env(PathBuf::from("/tmp/gate-default")).unwrap();
        assert_eq!(cfg.lease_ms, DEFAULT_LEASE_MS);
        assert_eq!(cfg.max_hold_ms, DEFAULT_MAX_HOLD_MS);
        assert_eq!(cfg.acquire_timeout_ms, DEFAULT_ACQUIRE_TIMEOUT_MS);
    }

    #[test]
    #[serial]
    fn env_override_takes_precedence_over_default() {
        std::env::set_var("GATE_LEASE_MS", "9000");
        let cfg = BrokerConfig::from_env(PathBuf::from("/tmp/gate-default")).unwrap();
        assert_eq!(cfg.lease_ms, 9000);
        std::env::remove_var("GATE_LEASE_MS");
    }

    #[test]
    #[serial]
    fn zero_duration_is_rejected() {
        std::env::set_var("GATE_LEASE_MS", "0");
        let result = BrokerConfig::from_env(PathBuf::from("/tmp/gate-default"));
        assert!(result.is_err());
        std::env::remove_var("GATE_LEASE_MS");
    }
}
