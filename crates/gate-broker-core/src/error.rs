//! Error taxonomy for the broker's domain and persistence layers.

use thiserror::Error;

/// Errors the broker can raise. Distinct from [`gate_proto::ErrorKind`],
/// which is the *wire* vocabulary a client sees — this is the broker's
/// internal vocabulary, mapped to a wire kind at the transport boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// `release`/`heartbeat` referenced an owner/path with no granted entry.
    #[error("no granted entry for owner {owner} on {path}")]
    NotHeld { path: String, owner: String },

    /// `heartbeat` found the entry already reclaimed by the expiry sweep.
    #[error("granted entry for owner {owner} on {path} was reclaimed")]
    Expired { path: String, owner: String },

    /// The durable store rejected or failed to apply a transaction.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the durable queue/audit store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("state directory unusable: {0}")]
    StateDir(String),

    #[error("corrupt persisted timestamp for {field}: {value}")]
    BadTimestamp { field: &'static str, value: String },
}
