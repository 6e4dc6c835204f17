//! Append-only audit log of lock lifecycle events.

use chrono::{DateTime, Utc};
use gate_proto::{LockMode, OwnerToken, PathKey};

/// One audit log event (§3: "enqueue, grant, release, expire, force_expire,
/// heartbeat").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Enqueue,
    Grant,
    Release,
    Expire,
    ForceExpire,
    Heartbeat,
}

impl AuditEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Grant => "grant",
            Self::Release => "release",
            Self::Expire => "expire",
            Self::ForceExpire => "force_expire",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// A fully-formed audit record ready to append.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub path: PathKey,
    pub owner: OwnerToken,
    pub mode: LockMode,
}
