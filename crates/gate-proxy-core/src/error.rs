//! Error taxonomy for the proxy, mapped to POSIX errno at the FUSE boundary.

use thiserror::Error;

/// Errors the proxy can raise while servicing a VFS operation. Every variant
/// maps to an `errno` in [`ProxyError::to_errno`] so the FUSE layer can
/// reply with a kernel-meaningful code instead of a generic I/O failure.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `acquire_timeout_ms` elapsed before the broker could grant the lock.
    #[error("timed out waiting for a lock on {path}")]
    QueueTimeout { path: String },

    /// The broker reported `not_held` for a handle that should have held a
    /// lock; the handle transitions to `lost`.
    #[error("lock on {path} is no longer held")]
    NotHeld { path: String },

    /// The broker reclaimed the lock via lease expiry; the handle transitions
    /// to `lost`.
    #[error("lease on {path} expired")]
    LeaseExpired { path: String },

    /// The broker force-expired the lock at the hard cap; the handle
    /// transitions to `lost`.
    #[error("hold on {path} exceeded the maximum lock duration")]
    ForceExpired { path: String },

    /// The broker connection could not be established or was dropped
    /// mid-request.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// A request or response frame failed to encode or decode.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The broker reported a persistence failure; state was left unchanged.
    #[error("broker store failure: {0}")]
    StoreFailure(String),

    /// The backing filesystem operation itself failed, with the lock held.
    /// The lock is still released normally by the caller.
    #[error("backing i/o error: {0}")]
    BackingIo(#[from] std::io::Error),
}

impl ProxyError {
    /// The `errno` a FUSE reply should carry for this error.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::QueueTimeout { .. } => libc::ETIMEDOUT,
            Self::NotHeld { .. } | Self::LeaseExpired { .. } | Self::ForceExpired { .. } => libc::ESTALE,
            Self::BrokerUnreachable(_) | Self::TransportError(_) => libc::EHOSTUNREACH,
            Self::StoreFailure(_) => libc::EIO,
            Self::BackingIo(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
