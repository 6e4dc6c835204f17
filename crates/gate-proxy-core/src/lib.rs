//! Pure VFS-to-lock mapping, owner identity, broker client, and the
//! per-handle state machine shared by the `gate-proxy` binary.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod mapping;
pub mod owner;

pub use client::{BrokerClient, BrokerEndpoint};
pub use config::ProxyConfig;
pub use error::ProxyError;
pub use handle::{HandleId, HandleRecord, HandleState, HandleTable};
pub use mapping::{plan_for, LockPlan, LockStep, VfsOp};
pub use owner::OwnerRegistry;
