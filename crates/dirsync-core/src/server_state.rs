//! Server state: the newest CSN seen per replica
//!
//! A replica uses its ServerState to discard updates it already applied and to
//! tell the relay where to resume. The relay keeps one per domain to gate
//! changelog appends.

use crate::csn::Csn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Generation ID of a backend that holds no data
pub const EMPTY_BACKEND_GENERATION_ID: i64 = 48;

/// `replica_id -> latest CSN`, monotonically non-decreasing per replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    csns: BTreeMap<i32, Csn>,
}

impl ServerState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn` if it is newer than what is stored for its replica
    ///
    /// Returns false for duplicates and out-of-order replays.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.replica_id) {
            Some(stored) if *stored >= csn => false,
            _ => {
                self.csns.insert(csn.replica_id, csn);
                true
            }
        }
    }

    /// Whether `csn` is already covered (stored CSN for its replica is >= csn)
    pub fn cover(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.replica_id)
            .is_some_and(|stored| stored >= csn)
    }

    /// Newest CSN recorded for a replica
    pub fn max_csn(&self, replica_id: i32) -> Option<Csn> {
        self.csns.get(&replica_id).copied()
    }

    /// Replica ids with at least one recorded change
    pub fn replica_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.csns.keys().copied()
    }

    /// Iterate `(replica_id, csn)` in replica id order
    pub fn iter(&self) -> impl Iterator<Item = (i32, Csn)> + '_ {
        self.csns.iter().map(|(id, csn)| (*id, *csn))
    }

    /// Whether no change was ever recorded
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Forget everything (full re-initialization)
    pub fn reset(&mut self) {
        self.csns.clear();
    }

    /// Deterministic checksum of the empty-backend seed, this state and an
    /// entry count
    ///
    /// An empty state with zero entries yields [`EMPTY_BACKEND_GENERATION_ID`].
    pub fn compute_generation_id(&self, entry_count: u64) -> i64 {
        if self.csns.is_empty() && entry_count == 0 {
            return EMPTY_BACKEND_GENERATION_ID;
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&EMPTY_BACKEND_GENERATION_ID.to_be_bytes());
        for csn in self.csns.values() {
            hasher.update(&csn.to_key());
        }
        hasher.update(&entry_count.to_be_bytes());
        let crc = hasher.finalize() as i64;
        ((entry_count as i64 & 0x7FFF_FFFF) << 32) | crc
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, csn) in self.csns.values().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", csn)?;
        }
        write!(f, "]")
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<T: IntoIterator<Item = Csn>>(iter: T) -> Self {
        let mut state = ServerState::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

/// ServerState behind a lock, so check-and-update is one atomic step
#[derive(Debug, Default)]
pub struct SharedServerState {
    inner: Mutex<ServerState>,
}

impl SharedServerState {
    /// Wrap an initial state
    pub fn new(initial: ServerState) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    /// Atomic [`ServerState::update`]
    pub fn update(&self, csn: Csn) -> bool {
        self.inner.lock().update(csn)
    }

    /// Atomic [`ServerState::cover`]
    pub fn cover(&self, csn: &Csn) -> bool {
        self.inner.lock().cover(csn)
    }

    /// Newest CSN recorded for a replica
    pub fn max_csn(&self, replica_id: i32) -> Option<Csn> {
        self.inner.lock().max_csn(replica_id)
    }

    /// Read-only copy
    pub fn snapshot(&self) -> ServerState {
        self.inner.lock().clone()
    }

    /// Replace the whole state (after a full import)
    pub fn replace_with(&self, state: ServerState) {
        *self.inner.lock() = state;
    }

    /// Forget everything
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Whether no change was ever recorded
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Generation ID of the current state
    pub fn compute_generation_id(&self, entry_count: u64) -> i64 {
        self.inner.lock().compute_generation_id(entry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_is_idempotent() {
        let mut state = ServerState::new();
        let csn = Csn::new(10, 0, 1);
        assert!(state.update(csn));
        assert!(!state.update(csn));
        assert!(!state.update(Csn::new(9, 5, 1)));
        assert!(state.update(Csn::new(10, 1, 1)));
        assert_eq!(state.max_csn(1), Some(Csn::new(10, 1, 1)));
    }

    #[test]
    fn test_replicas_are_independent() {
        let mut state = ServerState::new();
        assert!(state.update(Csn::new(100, 0, 1)));
        assert!(state.update(Csn::new(5, 0, 2)));
        assert!(state.cover(&Csn::new(50, 0, 1)));
        assert!(!state.cover(&Csn::new(6, 0, 2)));
        assert!(!state.cover(&Csn::new(1, 0, 3)));
        assert_eq!(state.replica_ids().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_generation_id_seed() {
        let state = ServerState::new();
        assert_eq!(state.compute_generation_id(0), EMPTY_BACKEND_GENERATION_ID);
        assert_ne!(state.compute_generation_id(3), EMPTY_BACKEND_GENERATION_ID);
    }

    #[test]
    fn test_generation_id_deterministic() {
        let a: ServerState = [Csn::new(1, 0, 1), Csn::new(2, 0, 2)].into_iter().collect();
        let b: ServerState = [Csn::new(2, 0, 2), Csn::new(1, 0, 1)].into_iter().collect();
        assert_eq!(a.compute_generation_id(10), b.compute_generation_id(10));
        assert_ne!(a.compute_generation_id(10), a.compute_generation_id(11));
    }

    #[test]
    fn test_reset_and_replace() {
        let shared = SharedServerState::new(ServerState::new());
        shared.update(Csn::new(1, 0, 1));
        assert!(!shared.is_empty());
        let other: ServerState = [Csn::new(7, 0, 4)].into_iter().collect();
        shared.replace_with(other.clone());
        assert_eq!(shared.snapshot(), other);
        shared.reset();
        assert!(shared.is_empty());
    }

    #[test]
    fn test_shared_update_atomic_under_contention() {
        let shared = Arc::new(SharedServerState::default());
        let csn = Csn::new(42, 0, 9);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || shared.update(csn))
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_serde_json_round_trip() {
        let state: ServerState = [Csn::new(3, 1, 2)].into_iter().collect();
        let json = serde_json::to_string(&state).unwrap();
        let back: ServerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
