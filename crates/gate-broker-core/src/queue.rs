//! Pure FIFO queue logic for a single path.
//!
//! No I/O, no async, no wall-clock reads beyond the `now` each method is
//! handed. This is the part of the broker that the invariants in the spec's
//! §3/§8 are about, kept separate from persistence and transport so it can
//! be driven directly by unit and property tests.

use chrono::{DateTime, Utc};
use gate_proto::{LockMode, OwnerToken, RequestId};

/// Whether a queue entry is currently waiting its turn or holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Waiting,
    Granted,
}

/// One request's position in a path's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub request_id: RequestId,
    pub enqueued_at: DateTime<Utc>,
    pub state: EntryState,
    pub hold_count: u32,
    pub granted_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Entry {
    fn new_waiting(
        owner: OwnerToken,
        mode: LockMode,
        request_id: RequestId,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            owner,
            mode,
            request_id,
            enqueued_at,
            state: EntryState::Waiting,
            hold_count: 1,
            granted_at: None,
            last_heartbeat: None,
        }
    }

    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self.state, EntryState::Granted)
    }
}

/// Outcome of a pure `acquire` call, before any persistence happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Granted immediately, re-entrantly, or by promotion of an existing
    /// waiting entry (caller must still check which — `was_reentrant`).
    Granted,
    /// Appended to the waiting suffix; not yet grantable.
    Enqueued,
}

/// A single path's FIFO queue: the ordered sequence of entries plus the
/// bookkeeping needed to find the granted prefix, the waiting head, and
/// promote waiters when the prefix shrinks.
#[derive(Debug, Clone, Default)]
pub struct PathQueue {
    entries: Vec<Entry>,
}

impl PathQueue {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Rehydrate a queue from persisted entries (used on broker restart).
    /// Entries must already be in FIFO order (`enqueued_at`, then
    /// `request_id`).
    #[must_use]
    pub const fn from_entries(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry belonging to `owner`, if any (granted or waiting).
    fn find_by_owner(&self, owner: OwnerToken) -> Option<usize> {
        self.entries.iter().position(|e| e.owner == owner)
    }

    fn granted_mode(&self) -> Option<LockMode> {
        self.entries.first().and_then(|e| e.is_granted().then_some(e.mode))
    }

    fn first_waiting_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.state == EntryState::Waiting)
    }

    /// Try to acquire `mode` for `owner`. Re-entrant if `owner` already
    /// holds a granted entry on this path (increments hold count and
    /// returns `Granted` without touching queue order). Otherwise appends a
    /// waiting entry and immediately tries to promote it.
    pub fn acquire(
        &mut self,
        mode: LockMode,
        owner: OwnerToken,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        if let Some(idx) = self.find_by_owner(owner) {
            if self.entries[idx].is_granted() {
                self.entries[idx].hold_count += 1;
                return AcquireOutcome::Granted;
            }
            // Owner already has a *waiting* entry for this path; re-entrancy
            // only applies to granted entries, so this is a second distinct
            // request and is left queued behind the first.
        }

        self.entries
            .push(Entry::new_waiting(owner, mode, request_id, now));
        self.promote(now);

        if self.entries.last().is_some_and(Entry::is_granted) {
            AcquireOutcome::Granted
        } else {
            AcquireOutcome::Enqueued
        }
    }

    /// Drop a still-`waiting` entry for `owner` (an `acquire_timeout_ms`
    /// expiry). Returns `true` if an entry was removed. Removal can unblock
    /// successors, so callers should re-run `promote` afterward — this
    /// method does that itself.
    pub fn drop_waiting(&mut self, owner: OwnerToken, now: DateTime<Utc>) -> bool {
        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.owner == owner && e.state == EntryState::Waiting)
        else {
            return false;
        };
        self.entries.remove(idx);
        self.promote(now);
        true
    }

    /// Decrement `owner`'s hold count on a granted entry; remove it at
    /// zero and promote any now-eligible waiters. Returns `Err(())` if
    /// `owner` holds no granted entry on this path.
    pub fn release(&mut self, owner: OwnerToken, now: DateTime<Utc>) -> Result<(), ()> {
        let Some(idx) = self.find_by_owner(owner) else {
            return Err(());
        };
        if !self.entries[idx].is_granted() {
            return Err(());
        }
        self.entries[idx].hold_count -= 1;
        if self.entries[idx].hold_count == 0 {
            self.entries.remove(idx);
        }
        self.promote(now);
        Ok(())
    }

    /// Force-remove a granted entry (lease expiry or hard cap), regardless
    /// of hold count, and promote successors. Returns the removed entry.
    pub fn force_release(&mut self, owner: OwnerToken, now: DateTime<Utc>) -> Option<Entry> {
        let idx = self.find_by_owner(owner)?;
        if !self.entries[idx].is_granted() {
            return None;
        }
        let removed = self.entries.remove(idx);
        self.promote(now);
        Some(removed)
    }

    /// Refresh `last_heartbeat` on `owner`'s granted entry.
    ///
    /// `Ok(())` on success, `Err(None)` if no entry exists for `owner`
    /// (`not_held`), `Err(Some(()))` if the entry exists but is still
    /// waiting (also `not_held` at the wire level — a waiter never holds a
    /// lease to refresh).
    pub fn heartbeat(&mut self, owner: OwnerToken, now: DateTime<Utc>) -> Result<(), ()> {
        let Some(idx) = self.find_by_owner(owner) else {
            return Err(());
        };
        if !self.entries[idx].is_granted() {
            return Err(());
        }
        self.entries[idx].last_heartbeat = Some(now);
        Ok(())
    }

    /// Promote as many waiting entries as the invariants allow, given the
    /// current granted prefix. Idempotent — safe to call after any mutation.
    fn promote(&mut self, now: DateTime<Utc>) {
        loop {
            let Some(head) = self.first_waiting_index() else {
                return;
            };
            let grantable = match self.granted_mode() {
                None => true,
                Some(LockMode::Read) => self.entries[head].mode == LockMode::Read,
                Some(LockMode::Write) => false,
            };
            if !grantable {
                return;
            }
            self.entries[head].state = EntryState::Granted;
            self.entries[head].granted_at = Some(now);
            self.entries[head].last_heartbeat = Some(now);

            // A freshly granted write entry must be the sole entry at the
            // front (enforced by `grantable` above when prefix was empty);
            // nothing more can promote behind it this round.
            if self.entries[head].mode == LockMode::Write {
                return;
            }
            // A freshly granted read entry: loop again in case the next
            // waiting entry is also a read (burst coalescing); the loop
            // naturally stops at a waiting write because `grantable` then
            // requires an empty prefix, which is false.
        }
    }

    /// Sweep out granted entries whose lease or hard cap has lapsed.
    /// Returns the owners that were reclaimed, tagged with whether it was a
    /// plain lease expiry or a hard-cap force-expire.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        lease_ms: i64,
        max_hold_ms: i64,
    ) -> Vec<(OwnerToken, SweepReason)> {
        let mut reclaimed = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if !self.entries[i].is_granted() {
                i += 1;
                continue;
            }
            let last_heartbeat = self.entries[i].last_heartbeat.unwrap_or(self.entries[i].enqueued_at);
            let granted_at = self.entries[i].granted_at.unwrap_or(self.entries[i].enqueued_at);
            let stale = (now - last_heartbeat).num_milliseconds() > lease_ms;
            let over_cap = (now - granted_at).num_milliseconds() > max_hold_ms;
            if stale || over_cap {
                let owner = self.entries[i].owner;
                reclaimed.push((
                    owner,
                    if over_cap && !stale {
                        SweepReason::ForceCap
                    } else {
                        SweepReason::LeaseExpired
                    },
                ));
                self.entries.remove(i);
                continue;
            }
            i += 1;
        }
        if !reclaimed.is_empty() {
            self.promote(now);
        }
        reclaimed
    }
}

/// Why the expiry sweep reclaimed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    LeaseExpired,
    ForceCap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t(offset_secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + Duration::seconds(offset_secs)
    }

    #[test]
    fn single_write_grants_immediately() {
        let mut q = PathQueue::new();
        let owner = OwnerToken::new();
        let outcome = q.acquire(LockMode::Write, owner, RequestId(1), t(0));
        assert_eq!(outcome, AcquireOutcome::Granted);
        assert_eq!(q.entries().len(), 1);
        assert!(q.entries()[0].is_granted());
    }

    #[test]
    fn writer_blocks_a_later_reader() {
        let mut q = PathQueue::new();
        let writer = OwnerToken::new();
        let reader = OwnerToken::new();
        assert_eq!(
            q.acquire(LockMode::Write, writer, RequestId(1), t(0)),
            AcquireOutcome::Granted
        );
        assert_eq!(
            q.acquire(LockMode::Read, reader, RequestId(2), t(1)),
            AcquireOutcome::Enqueued
        );
        assert!(q.entries()[1].state == EntryState::Waiting);
    }

    #[test]
    fn readers_coalesce_with_no_writer_queued() {
        let mut q = PathQueue::new();
        let a = OwnerToken::new();
        let b = OwnerToken::new();
        let c = OwnerToken::new();
        assert_eq!(q.acquire(LockMode::Read, a, RequestId(1), t(0)), AcquireOutcome::Granted);
        assert_eq!(q.acquire(LockMode::Read, b, RequestId(2), t(0)), AcquireOutcome::Granted);
        assert_eq!(q.acquire(LockMode::Read, c, RequestId(3), t(0)), AcquireOutcome::Granted);
        assert!(q.entries().iter().all(Entry::is_granted));
    }

    #[test]
    fn reader_starvation_prevention() {
        // A holds read; W queues write; later C queues read. W must be
        // granted before C, and C must not jump the queue.
        let mut q = PathQueue::new();
        let a = OwnerToken::new();
        let w = OwnerToken::new();
        let c = OwnerToken::new();
        assert_eq!(q.acquire(LockMode::Read, a, RequestId(1), t(0)), AcquireOutcome::Granted);
        assert_eq!(q.acquire(LockMode::Write, w, RequestId(2), t(1)), AcquireOutcome::Enqueued);
        assert_eq!(q.acquire(LockMode::Read, c, RequestId(3), t(2)), AcquireOutcome::Enqueued);

        // A releases; W (not C) should be promoted.
        q.release(a, t(3)).expect("a holds an entry");
        assert!(q.entries().iter().find(|e| e.owner == w).unwrap().is_granted());
        assert!(q.entries().iter().find(|e| e.owner == c).unwrap().state == EntryState::Waiting);

        // W releases; now C is promoted.
        q.release(w, t(4)).expect("w holds an entry");
        assert!(q.entries().iter().find(|e| e.owner == c).unwrap().is_granted());
    }

    #[test]
    fn reentrant_acquire_increments_hold_count() {
        let mut q = PathQueue::new();
        let owner = OwnerToken::new();
        assert_eq!(q.acquire(LockMode::Write, owner, RequestId(1), t(0)), AcquireOutcome::Granted);
        assert_eq!(q.acquire(LockMode::Write, owner, RequestId(2), t(1)), AcquireOutcome::Granted);
        assert_eq!(q.acquire(LockMode::Write, owner, RequestId(3), t(2)), AcquireOutcome::Granted);
        assert_eq!(q.entries().len(), 1);
        assert_eq!(q.entries()[0].hold_count, 3);

        q.release(owner, t(3)).unwrap();
        q.release(owner, t(3)).unwrap();
        assert_eq!(q.entries().len(), 1, "entry survives until hold count hits zero");
        q.release(owner, t(3)).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn release_of_unheld_owner_is_an_error() {
        let mut q = PathQueue::new();
        let owner = OwnerToken::new();
        assert_eq!(q.release(owner, t(0)), Err(()));
    }

    #[test]
    fn sweep_reclaims_stale_lease_and_promotes_next() {
        let mut q = PathQueue::new();
        let stale = OwnerToken::new();
        let next = OwnerToken::new();
        q.acquire(LockMode::Write, stale, RequestId(1), t(0));
        q.acquire(LockMode::Write, next, RequestId(2), t(1));

        // 300s lease, entry last heartbeated at t(0); at t(400) it's stale.
        let reclaimed = q.sweep(t(400), 300_000, 3_600_000);
        assert_eq!(reclaimed, vec![(stale, SweepReason::LeaseExpired)]);
        assert!(q.entries().iter().find(|e| e.owner == next).unwrap().is_granted());
    }

    #[test]
    fn sweep_force_expires_at_hard_cap_even_with_heartbeats() {
        let mut q = PathQueue::new();
        let owner = OwnerToken::new();
        q.acquire(LockMode::Write, owner, RequestId(1), t(0));
        q.heartbeat(owner, t(5)).unwrap();

        // Heartbeat is fresh (lease_ms huge) but granted_at is old enough to
        // exceed max_hold_ms.
        let reclaimed = q.sweep(t(100), 10_000_000, 50_000);
        assert_eq!(reclaimed, vec![(owner, SweepReason::ForceCap)]);
    }

    #[test]
    fn drop_waiting_unblocks_successor() {
        let mut q = PathQueue::new();
        let writer = OwnerToken::new();
        let impatient = OwnerToken::new();
        let patient = OwnerToken::new();
        q.acquire(LockMode::Write, writer, RequestId(1), t(0));
        q.acquire(LockMode::Write, impatient, RequestId(2), t(1));
        q.acquire(LockMode::Write, patient, RequestId(3), t(2));

        assert!(q.drop_waiting(impatient, t(3)));
        q.release(writer, t(4)).unwrap();
        assert!(q.entries().iter().find(|e| e.owner == patient).unwrap().is_granted());
    }
}
