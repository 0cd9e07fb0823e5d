//! Remote changes waiting for a change they depend on
//!
//! Changes of different replicas can reach a directory server in an order
//! the data does not allow: a child before its parent, a modify before the
//! add of its target, the delete of a parent before the deletes of its
//! children. Such a change is held here and retried once another change
//! has been applied. Changes that touch a held entry queue up behind it so
//! one entry never sees its changes out of CSN order.

use crate::backend::{Dn, OperationRequest, ResultCode};
use crate::csn::Csn;
use crate::protocol::UpdateMsg;
use std::collections::BTreeMap;

/// Whether a failed replay may succeed once another change is applied
pub(crate) fn is_dependency_failure(code: ResultCode) -> bool {
    matches!(
        code,
        ResultCode::NoSuchObject | ResultCode::NotAllowedOnNonLeaf
    )
}

/// Held remote changes, in CSN order
#[derive(Debug)]
pub(crate) struct PendingChanges {
    held: BTreeMap<Csn, UpdateMsg>,
    capacity: usize,
}

impl PendingChanges {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            held: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.held.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Whether a change of `dn` has to wait behind a held change
    pub(crate) fn blocks(&self, dn: &Dn) -> bool {
        self.held.values().any(|held| depends_on(dn, held))
    }

    /// Hold `update`; returns the oldest held change when over capacity
    pub(crate) fn hold(&mut self, update: UpdateMsg) -> Option<UpdateMsg> {
        self.held.insert(update.csn, update);
        if self.held.len() > self.capacity {
            self.held.pop_first().map(|(_, evicted)| evicted)
        } else {
            None
        }
    }

    /// Held changes no earlier held change blocks, oldest first
    pub(crate) fn ready(&self) -> Vec<Csn> {
        let mut ready = Vec::new();
        for (index, (csn, update)) in self.held.iter().enumerate() {
            let blocked = self
                .held
                .values()
                .take(index)
                .any(|earlier| depends_on(update.dn(), earlier));
            if !blocked {
                ready.push(*csn);
            }
        }
        ready
    }

    pub(crate) fn take(&mut self, csn: &Csn) -> Option<UpdateMsg> {
        self.held.remove(csn)
    }

    pub(crate) fn clear(&mut self) {
        self.held.clear();
    }
}

/// Same entry, or below an entry whose add is still held
fn depends_on(dn: &Dn, held: &UpdateMsg) -> bool {
    let held_dn = held.dn();
    if dn == held_dn {
        return true;
    }
    matches!(held.operation, OperationRequest::Add { .. }) && dn.is_descendant_of(held_dn)
}
