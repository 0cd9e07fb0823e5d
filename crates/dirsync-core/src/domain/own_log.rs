//! Own-change log (circular buffer)
//!
//! Keeps the most recent updates this replica published so they can be
//! resent when a new session starts and the relay has not seen them yet.

use crate::broker::ResendSource;
use crate::protocol::UpdateMsg;
use crate::server_state::ServerState;
use parking_lot::RwLock;
use std::collections::VecDeque;

/// Bounded log of own published updates, in CSN order
#[derive(Debug)]
pub struct OwnChangeLog {
    replica_id: i32,
    capacity: usize,
    entries: RwLock<VecDeque<UpdateMsg>>,
}

impl OwnChangeLog {
    /// Empty log holding at most `capacity` updates
    pub fn new(replica_id: i32, capacity: usize) -> Self {
        Self {
            replica_id,
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.clamp(1, 1024))),
        }
    }

    /// Append an update, evicting the oldest when full
    pub fn push(&self, update: UpdateMsg) {
        let mut log = self.entries.write();
        if log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(update);
    }

    /// Number of updates kept
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Forget everything (after a full import)
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl ResendSource for OwnChangeLog {
    fn updates_after(&self, relay_state: &ServerState) -> Vec<UpdateMsg> {
        let seen = relay_state.max_csn(self.replica_id);
        self.entries
            .read()
            .iter()
            .filter(|update| seen.is_none_or(|csn| update.csn > csn))
            .cloned()
            .collect()
    }
}
