//! Per-path owner token identity for open handles (§4.2).
//!
//! A fresh owner token is minted on each new open. While a handle is open
//! against a path, subsequent metadata operations on that same path reuse
//! the handle's token, so a write-then-`utimens` sequence from the same
//! editor process is re-entrant rather than self-deadlocking. New opens
//! never reuse another open's token.

use std::collections::HashMap;
use std::sync::Mutex;

use gate_proto::{OwnerToken, PathKey};

struct Slot {
    owner: OwnerToken,
    refs: u32,
}

/// Tracks which owner token is "active" for a path because a handle is
/// currently open against it.
#[derive(Default)]
pub struct OwnerRegistry {
    active: Mutex<HashMap<PathKey, Slot>>,
}

impl OwnerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh owner token for a brand-new open on `path`. Always
    /// distinct from any token already registered for another path's open.
    #[must_use]
    pub fn open(&self, path: &PathKey) -> OwnerToken {
        let owner = OwnerToken::new();
        let mut active = self.active.lock().expect("owner registry mutex poisoned");
        active.insert(path.clone(), Slot { owner, refs: 1 });
        owner
    }

    /// The owner token to use for a metadata operation on `path`, if a
    /// handle is already open against it; `None` means the caller must mint
    /// its own transient token (no handle is open for this op).
    #[must_use]
    pub fn active_owner(&self, path: &PathKey) -> Option<OwnerToken> {
        let active = self.active.lock().expect("owner registry mutex poisoned");
        active.get(path).map(|slot| slot.owner)
    }

    /// Register an additional reference to an already-open path's token
    /// (e.g. `dup()` of an existing handle).
    pub fn retain(&self, path: &PathKey) {
        let mut active = self.active.lock().expect("owner registry mutex poisoned");
        if let Some(slot) = active.get_mut(path) {
            slot.refs += 1;
        }
    }

    /// Drop one reference to `path`'s active token; once it reaches zero the
    /// path is no longer considered open and a later open mints a new token.
    /// Returns `true` if this was the last reference.
    pub fn close(&self, path: &PathKey) -> bool {
        let mut active = self.active.lock().expect("owner registry mutex poisoned");
        let Some(slot) = active.get_mut(path) else {
            return false;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            active.remove(path);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_after_close_mints_a_new_token() {
        let registry = OwnerRegistry::new();
        let path = "/f".to_string();
        let first = registry.open(&path);
        assert!(registry.close(&path));
        let second = registry.open(&path);
        assert_ne!(first, second);
    }

    #[test]
    fn concurrent_ops_on_the_same_open_handle_reuse_the_token() {
        let registry = OwnerRegistry::new();
        let path = "/f".to_string();
        let opened = registry.open(&path);
        assert_eq!(registry.active_owner(&path), Some(opened));
    }

    #[test]
    fn unrelated_paths_never_share_a_token() {
        let registry = OwnerRegistry::new();
        let a = registry.open(&"/a".to_string());
        let b = registry.open(&"/b".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn refcount_keeps_token_alive_until_last_close() {
        let registry = OwnerRegistry::new();
        let path = "/f".to_string();
        let token = registry.open(&path);
        registry.retain(&path);
        assert!(!registry.close(&path), "one ref remains");
        assert_eq!(registry.active_owner(&path), Some(token));
        assert!(registry.close(&path), "last ref closes");
        assert_eq!(registry.active_owner(&path), None);
    }
}
