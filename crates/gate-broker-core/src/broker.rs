//! The async `Broker`: owns one [`PathQueue`] per path behind a mutex,
//! persists every state change before acknowledging it, and wakes waiters
//! through a per-path [`Notify`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use gate_proto::{EntrySnapshot, OwnerToken, PathKey, PathSnapshot, RequestId};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditRecord};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::queue::{AcquireOutcome, PathQueue, SweepReason};
use crate::store::{EntryUpsert, Store};
use gate_proto::LockMode;

struct PathState {
    queue: PathQueue,
    notify: Arc<Notify>,
    /// Owners the expiry sweep reclaimed from this path whose next
    /// `heartbeat` hasn't yet observed the reclaim. Consulted once by
    /// `heartbeat` (to answer `expired` instead of a bare `not_held`) and
    /// then dropped, so it never grows beyond the sweep's own churn.
    recently_reclaimed: HashMap<OwnerToken, SweepReason>,
}

impl PathState {
    fn new() -> Self {
        Self {
            queue: PathQueue::new(),
            notify: Arc::new(Notify::new()),
            recently_reclaimed: HashMap::new(),
        }
    }

    fn from_queue(queue: PathQueue) -> Self {
        Self {
            queue,
            notify: Arc::new(Notify::new()),
            recently_reclaimed: HashMap::new(),
        }
    }
}

/// Shared broker state: one [`PathQueue`] per path, a durable [`Store`], and
/// the configured lease/cap/timeout windows.
pub struct Broker {
    state: Mutex<HashMap<PathKey, PathState>>,
    store: Store,
    config: BrokerConfig,
}

impl Broker {
    /// Open the durable store at `config.db_path()` and rehydrate every
    /// persisted queue. Per §6, restored granted entries get a fresh
    /// `last_heartbeat` so a restart doesn't immediately look stale.
    pub async fn open(config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let store = Store::open(&config.db_path()).await?;
        let persisted = store.load_all().await?;
        let now = Utc::now();

        let mut state = HashMap::new();
        for (path, mut entries) in persisted {
            for e in &mut entries {
                if e.is_granted() {
                    e.last_heartbeat = Some(now);
                }
            }
            state.insert(path, PathState::from_queue(PathQueue::from_entries(entries)));
        }

        info!(paths = state.len(), "broker restored queue state from disk");

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            store,
            config,
        }))
    }

    /// In-memory broker for tests.
    #[cfg(test)]
    pub async fn open_in_memory(config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let store = Store::open_in_memory().await?;
        Ok(Arc::new(Self {
            state: Mutex::new(HashMap::new()),
            store,
            config,
        }))
    }

    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Acquire `mode` on `path` for `owner`, blocking until granted or
    /// `acquire_timeout_ms` elapses. Returns `Ok(true)` if granted,
    /// `Ok(false)` on timeout (the caller's waiting entry is dropped before
    /// returning).
    pub async fn acquire(
        self: &Arc<Self>,
        path: PathKey,
        mode: LockMode,
        owner: OwnerToken,
        request_id: RequestId,
        acquire_timeout_ms: u64,
    ) -> Result<bool, BrokerError> {
        let deadline = StdDuration::from_millis(acquire_timeout_ms);
        let started = std::time::Instant::now();

        loop {
            let notify = {
                let mut state = self.state.lock().await;
                let now = Utc::now();
                let entry = state.entry(path.clone()).or_insert_with(PathState::new);
                let outcome = entry.queue.acquire(mode, owner, request_id, now);
                self.persist_queue(&path, &entry.queue, audit_for(&path, owner, mode, outcome))
                    .await?;

                if matches!(outcome, AcquireOutcome::Granted) {
                    return Ok(true);
                }
                Arc::clone(&entry.notify)
            };

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                self.abandon_wait(&path, owner).await?;
                return Ok(false);
            }
            let remaining = deadline - elapsed;

            if tokio::time::timeout(remaining, notify.notified()).await.is_err() {
                self.abandon_wait(&path, owner).await?;
                return Ok(false);
            }

            // Woken up; re-check this owner's own entry state rather than
            // assuming the wakeup was for us.
            let state = self.state.lock().await;
            if let Some(entry) = state.get(&path) {
                if entry
                    .queue
                    .entries()
                    .iter()
                    .any(|e| e.owner == owner && e.is_granted())
                {
                    return Ok(true);
                }
            }
        }
    }

    async fn abandon_wait(&self, path: &PathKey, owner: OwnerToken) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(path) else {
            return Ok(());
        };
        let now = Utc::now();
        if entry.queue.drop_waiting(owner, now) {
            self.persist_queue(path, &entry.queue, Vec::new()).await?;
            entry.notify.notify_waiters();
        }
        Ok(())
    }

    /// Release one hold of `owner`'s granted entry on `path`.
    pub async fn release(&self, path: PathKey, owner: OwnerToken) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let entry = state
            .get_mut(&path)
            .ok_or_else(|| BrokerError::NotHeld { path: path.clone(), owner: owner.to_string() })?;
        let now = Utc::now();
        let mode = entry
            .queue
            .entries()
            .iter()
            .find(|e| e.owner == owner)
            .map(|e| e.mode);

        entry
            .queue
            .release(owner, now)
            .map_err(|()| BrokerError::NotHeld { path: path.clone(), owner: owner.to_string() })?;

        let audit = mode
            .map(|mode| vec![audit_record(&path, owner, mode, AuditEvent::Release, now)])
            .unwrap_or_default();
        self.persist_queue(&path, &entry.queue, audit).await?;
        entry.notify.notify_waiters();
        Ok(())
    }

    /// Refresh the lease on `owner`'s granted entry on `path`. Returns
    /// [`BrokerError::Expired`] instead of [`BrokerError::NotHeld`] when the
    /// entry was granted but the sweep reclaimed it before this heartbeat
    /// arrived (§4.1's `{ok, not_held, expired}` outcome set).
    pub async fn heartbeat(&self, path: PathKey, owner: OwnerToken) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let entry = state
            .get_mut(&path)
            .ok_or_else(|| BrokerError::NotHeld { path: path.clone(), owner: owner.to_string() })?;
        let now = Utc::now();
        if entry.queue.heartbeat(owner, now).is_err() {
            return Err(if entry.recently_reclaimed.remove(&owner).is_some() {
                BrokerError::Expired { path: path.clone(), owner: owner.to_string() }
            } else {
                BrokerError::NotHeld { path: path.clone(), owner: owner.to_string() }
            });
        }

        let mode = entry.queue.entries().iter().find(|e| e.owner == owner).map(|e| e.mode);
        let audit = mode
            .map(|mode| vec![audit_record(&path, owner, mode, AuditEvent::Heartbeat, now)])
            .unwrap_or_default();
        self.persist_queue(&path, &entry.queue, audit).await?;
        Ok(())
    }

    /// Snapshot every tracked path's queue, for `Status`.
    pub async fn status(&self) -> Vec<PathSnapshot> {
        let state = self.state.lock().await;
        state
            .iter()
            .filter(|(_, s)| !s.queue.is_empty())
            .map(|(path, s)| PathSnapshot {
                path: path.clone(),
                entries: s
                    .queue
                    .entries()
                    .iter()
                    .map(|e| EntrySnapshot {
                        owner: e.owner,
                        mode: e.mode,
                        request_id: e.request_id,
                        granted: e.is_granted(),
                        hold_count: e.hold_count,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Sweep every path for lease-expired and hard-cap-exceeded grants.
    /// Intended to be called periodically by [`crate::sweep::run_sweep_loop`].
    pub async fn sweep_once(&self) -> Result<usize, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut reclaimed_total = 0;

        for (path, entry) in state.iter_mut() {
            let reclaimed = entry.queue.sweep(now, i64_ms(self.config.lease_ms), i64_ms(self.config.max_hold_ms));
            if reclaimed.is_empty() {
                continue;
            }
            reclaimed_total += reclaimed.len();

            let mut audit = Vec::with_capacity(reclaimed.len());
            for (owner, reason) in &reclaimed {
                let event = match reason {
                    SweepReason::LeaseExpired => AuditEvent::Expire,
                    SweepReason::ForceCap => AuditEvent::ForceExpire,
                };
                warn!(%path, %owner, reason = ?reason, "broker reclaimed a stale grant");
                entry.recently_reclaimed.insert(*owner, *reason);
                audit.push(AuditRecord {
                    timestamp: now,
                    event,
                    path: path.clone(),
                    owner: *owner,
                    // Mode is unknown after removal; `sweep` doesn't return it,
                    // and the audit event's meaning doesn't depend on it, so
                    // Write is used as a harmless placeholder value.
                    mode: LockMode::Write,
                });
            }

            let removals: Vec<_> = reclaimed.iter().map(|(o, _)| (path.clone(), *o)).collect();
            self.store.apply(&[], &removals, &audit).await?;
            entry.notify.notify_waiters();
        }

        if reclaimed_total > 0 {
            debug!(count = reclaimed_total, "sweep reclaimed stale grants");
        }
        Ok(reclaimed_total)
    }

    async fn persist_queue(
        &self,
        path: &PathKey,
        queue: &PathQueue,
        audit: Vec<AuditRecord>,
    ) -> Result<(), BrokerError> {
        let upserts: Vec<EntryUpsert> = queue
            .entries()
            .iter()
            .map(|e| EntryUpsert { path: path.clone(), entry: e.clone() })
            .collect();
        self.store.apply(&upserts, &[], &audit).await?;
        Ok(())
    }
}

fn i64_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn audit_for(
    path: &PathKey,
    owner: OwnerToken,
    mode: LockMode,
    outcome: AcquireOutcome,
) -> Vec<AuditRecord> {
    let event = match outcome {
        AcquireOutcome::Granted => AuditEvent::Grant,
        AcquireOutcome::Enqueued => AuditEvent::Enqueue,
    };
    vec![audit_record(path, owner, mode, event, Utc::now())]
}

fn audit_record(
    path: &PathKey,
    owner: OwnerToken,
    mode: LockMode,
    event: AuditEvent,
    timestamp: DateTime<Utc>,
) -> AuditRecord {
    AuditRecord { timestamp, event, path: path.clone(), owner, mode }
}
