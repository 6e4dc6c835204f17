//! Per-handle state machine (§4.2) and the background heartbeat task that
//! keeps every open handle's lock lease alive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gate_proto::{LockMode, OwnerToken, PathKey};
use tokio::sync::Mutex;
use tracing::warn;

use crate::client::BrokerClient;

/// Where a handle sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Opening,
    Open,
    Closing,
    /// Lease expiry or a broker `not_held` report; subsequent operations on
    /// this handle must fail with an I/O error.
    Lost,
}

/// An open file handle tracked by the proxy: the lock it holds and where it
/// is in its lifecycle.
#[derive(Debug, Clone)]
pub struct HandleRecord {
    pub path: PathKey,
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub state: HandleState,
}

/// Numeric handle identifiers, matching FUSE's `fh` field.
pub type HandleId = u64;

/// Every open handle, keyed by the id the kernel uses to refer back to it.
#[derive(Default)]
pub struct HandleTable {
    handles: Mutex<HashMap<HandleId, HandleRecord>>,
    next_id: AtomicU64,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self { handles: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Register a freshly opened handle in the `Opening` state and return
    /// its id. Callers transition it to `Open` once the lock is granted.
    pub async fn insert(&self, path: PathKey, owner: OwnerToken, mode: LockMode) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.handles.lock().await;
        handles.insert(id, HandleRecord { path, owner, mode, state: HandleState::Opening });
        id
    }

    pub async fn mark_open(&self, id: HandleId) {
        if let Some(record) = self.handles.lock().await.get_mut(&id) {
            record.state = HandleState::Open;
        }
    }

    pub async fn mark_closing(&self, id: HandleId) {
        if let Some(record) = self.handles.lock().await.get_mut(&id) {
            record.state = HandleState::Closing;
        }
    }

    pub async fn remove(&self, id: HandleId) -> Option<HandleRecord> {
        self.handles.lock().await.remove(&id)
    }

    pub async fn get(&self, id: HandleId) -> Option<HandleRecord> {
        self.handles.lock().await.get(&id).cloned()
    }

    /// Mark every handle sharing `owner`'s lock on `path` as `Lost`.
    async fn mark_lost(&self, path: &PathKey, owner: OwnerToken) {
        let mut handles = self.handles.lock().await;
        for record in handles.values_mut() {
            if record.path == *path && record.owner == owner {
                warn!(%path, %owner, "handle lock lost");
                record.state = HandleState::Lost;
            }
        }
    }

    /// The distinct `(path, owner)` pairs currently backing an `Open`
    /// handle — the set the heartbeat task needs to refresh.
    async fn open_locks(&self) -> HashSet<(PathKey, OwnerToken)> {
        let handles = self.handles.lock().await;
        handles
            .values()
            .filter(|r| r.state == HandleState::Open)
            .map(|r| (r.path.clone(), r.owner))
            .collect()
    }
}

/// Run forever, heartbeating every distinct open lock at `interval`.
/// Per §4.2, `interval` should be comfortably below `lease_ms` (suggested
/// `lease_ms / 3`); a heartbeat that comes back `not_held`/`expired` marks
/// every handle sharing that lock `Lost`.
pub async fn run_heartbeat_loop(client: Arc<BrokerClient>, handles: Arc<HandleTable>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for (path, owner) in handles.open_locks().await {
            if let Err(err) = client.heartbeat(path.clone(), owner).await {
                warn!(%path, %owner, %err, "heartbeat failed, marking handle lost");
                handles.mark_lost(&path, owner).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_fresh_handle_starts_opening() {
        let table = HandleTable::new();
        let owner = OwnerToken::new();
        let id = table.insert("/f".to_string(), owner, LockMode::Write).await;
        let record = table.get(id).await.unwrap();
        assert_eq!(record.state, HandleState::Opening);
    }

    #[tokio::test]
    async fn mark_open_then_remove_round_trips() {
        let table = HandleTable::new();
        let owner = OwnerToken::new();
        let id = table.insert("/f".to_string(), owner, LockMode::Read).await;
        table.mark_open(id).await;
        assert_eq!(table.get(id).await.unwrap().state, HandleState::Open);
        let removed = table.remove(id).await.unwrap();
        assert_eq!(removed.path, "/f");
        assert!(table.get(id).await.is_none());
    }

    #[tokio::test]
    async fn mark_lost_affects_every_handle_sharing_the_lock() {
        let table = HandleTable::new();
        let owner = OwnerToken::new();
        let a = table.insert("/f".to_string(), owner, LockMode::Write).await;
        let b = table.insert("/f".to_string(), owner, LockMode::Write).await;
        table.mark_open(a).await;
        table.mark_open(b).await;

        table.mark_lost(&"/f".to_string(), owner).await;

        assert_eq!(table.get(a).await.unwrap().state, HandleState::Lost);
        assert_eq!(table.get(b).await.unwrap().state, HandleState::Lost);
    }

    #[tokio::test]
    async fn open_locks_only_counts_open_state() {
        let table = HandleTable::new();
        let owner = OwnerToken::new();
        let id = table.insert("/f".to_string(), owner, LockMode::Write).await;
        assert!(table.open_locks().await.is_empty(), "still opening, not yet open");
        table.mark_open(id).await;
        assert_eq!(table.open_locks().await.len(), 1);
    }
}
