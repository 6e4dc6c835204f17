//! Wire schema for the broker ↔ proxy transport.
//!
//! Both sides speak newline-delimited JSON over a Unix-domain socket or a
//! loopback TCP socket: one [`Request`] per line in, one [`Response`] per
//! line out. Nothing here does I/O; [`Request::to_line`] and
//! [`Response::from_line`] (and their inverses) are the only boundary.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical absolute path of the object a lock is held against.
///
/// Opaque to the broker: no validation beyond "non-empty" happens here.
/// Canonicalization is the proxy's job (§3 of the spec — paths are opaque
/// identifiers to the broker).
pub type PathKey = String;

/// Opaque identifier grouping re-entrant acquires from a single logical
/// holder. Minted by the proxy, never introspected by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(pub uuid::Uuid);

impl OwnerToken {
    /// Mint a fresh, globally-unique owner token.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing tie-breaker for requests that land in the same
/// millisecond. Assigned by the proxy at request construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

/// Shared or exclusive lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A request sent from the proxy to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Acquire `mode` on `path` for `owner`. Blocks broker-side until
    /// grantable or `acquire_timeout_ms` elapses.
    Acquire {
        path: PathKey,
        mode: LockMode,
        owner: OwnerToken,
        request_id: RequestId,
        acquire_timeout_ms: u64,
    },
    /// Release one hold of `owner`'s granted entry on `path`.
    Release { path: PathKey, owner: OwnerToken },
    /// Refresh the lease on `owner`'s granted entry on `path`.
    Heartbeat { path: PathKey, owner: OwnerToken },
    /// Request an observability snapshot of all queues.
    Status,
}

/// Error kinds a client must be able to distinguish (§7 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueueTimeout,
    NotHeld,
    LeaseExpired,
    ForceExpired,
    BrokerUnreachable,
    TransportError,
    StoreFailure,
    BackingIoError,
}

/// A snapshot of one path's queue, for `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSnapshot {
    pub path: PathKey,
    pub entries: Vec<EntrySnapshot>,
}

/// A single queue entry as reported by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub request_id: RequestId,
    pub granted: bool,
    pub hold_count: u32,
}

/// A response sent from the broker back to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The lock was granted (immediately, re-entrantly, or after waiting).
    Granted,
    /// Non-blocking acquire variant: the request was enqueued but not yet
    /// granted.
    Queued,
    /// `acquire_timeout_ms` elapsed before the request became grantable.
    Timeout,
    /// `release`/`heartbeat` referenced an owner/path with no granted entry.
    NotHeld,
    /// `heartbeat` found the entry reclaimed by the expiry sweep.
    Expired,
    /// Result of `Status`.
    StatusOk { paths: Vec<PathSnapshot> },
    /// The operation failed.
    Error { error_kind: ErrorKind, message: String },
}

/// Errors raised while encoding or decoding a wire frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Request {
    /// Encode as a single newline-terminated JSON line.
    #[must_use]
    pub fn to_line(&self) -> String {
        // `serde_json::to_string` cannot fail for these types: no maps with
        // non-string keys, no floats that could be NaN/inf.
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "null".to_string());
        line.push('\n');
        line
    }

    /// Decode a single line (without its trailing newline) into a request.
    pub fn from_line(line: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

impl Response {
    /// Encode as a single newline-terminated JSON line.
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "null".to_string());
        line.push('\n');
        line
    }

    /// Decode a single line (without its trailing newline) into a response.
    pub fn from_line(line: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Build an [`ErrorKind::BrokerUnreachable`] response for local use by a
    /// client that never got a reply (e.g. the connection dropped).
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Error {
            error_kind: ErrorKind::BrokerUnreachable,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_round_trips_through_a_line() {
        let req = Request::Acquire {
            path: "/repo/src/main.rs".to_string(),
            mode: LockMode::Write,
            owner: OwnerToken::new(),
            request_id: RequestId(42),
            acquire_timeout_ms: 5000,
        };
        let line = req.to_line();
        assert!(line.ends_with('\n'));
        let decoded = Request::from_line(&line).expect("decodes");
        match decoded {
            Request::Acquire { path, mode, request_id, .. } => {
                assert_eq!(path, "/repo/src/main.rs");
                assert_eq!(mode, LockMode::Write);
                assert_eq!(request_id, RequestId(42));
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn expired_and_not_held_are_distinct_on_the_wire() {
        let expired = Response::Expired.to_line();
        let not_held = Response::NotHeld.to_line();
        assert_ne!(expired, not_held);
        assert!(matches!(Response::from_line(&expired).unwrap(), Response::Expired));
        assert!(matches!(Response::from_line(&not_held).unwrap(), Response::NotHeld));
    }

    #[test]
    fn malformed_frame_is_a_codec_error_not_a_panic() {
        let err = Request::from_line("{not json");
        assert!(matches!(err, Err(CodecError::Malformed(_))));
    }
}
