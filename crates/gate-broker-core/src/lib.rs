//! Domain logic and durable state for the lock broker: the FIFO queue per
//! path, its SQLite-backed persistence, the async [`Broker`] that wraps both
//! behind owner/lease semantics, and the periodic expiry sweep.

#![forbid(unsafe_code)]

pub mod audit;
pub mod broker;
pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod sweep;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, StoreError};
pub use queue::{AcquireOutcome, Entry, EntryState, PathQueue, SweepReason};
