//! In-memory backend used by tests and the demo node

use super::{Backend, Dn, Entry, ModificationType, OperationRequest, ResultCode};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Entries keyed by normalized DN
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Entry>>,
    inconsistent: AtomicBool,
}

impl MemoryBackend {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend preloaded with entries
    pub fn with_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let backend = Self::new();
        {
            let mut map = backend.entries.write();
            for entry in entries {
                map.insert(entry.dn.normalized().to_string(), entry);
            }
        }
        backend
    }

    /// Total number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn add(&self, entry: &Entry) -> ResultCode {
        let mut map = self.entries.write();
        let key = entry.dn.normalized().to_string();
        if map.contains_key(&key) {
            return ResultCode::EntryAlreadyExists;
        }
        // Suffix entries have no stored parent; anything below one needs it.
        if let Some(parent) = entry.dn.parent() {
            let parent_known = map.contains_key(parent.normalized());
            let under_stored_suffix = map
                .values()
                .any(|stored| entry.dn.is_descendant_of(&stored.dn));
            if !parent_known && under_stored_suffix {
                return ResultCode::NoSuchObject;
            }
        }
        map.insert(key, entry.clone());
        ResultCode::Success
    }

    fn delete(&self, dn: &Dn) -> ResultCode {
        let mut map = self.entries.write();
        if !map.contains_key(dn.normalized()) {
            return ResultCode::NoSuchObject;
        }
        if has_children(&map, dn) {
            return ResultCode::NotAllowedOnNonLeaf;
        }
        map.remove(dn.normalized());
        ResultCode::Success
    }

    fn modify(&self, dn: &Dn, modifications: &[super::Modification]) -> ResultCode {
        let mut map = self.entries.write();
        let Some(current) = map.get(dn.normalized()) else {
            return ResultCode::NoSuchObject;
        };

        let mut updated = current.clone();
        for m in modifications {
            match m.kind {
                ModificationType::Add => {
                    for value in &m.values {
                        if !updated.add_value(&m.attribute, value.clone()) {
                            return ResultCode::AttributeOrValueExists;
                        }
                    }
                }
                ModificationType::Delete => {
                    if m.values.is_empty() {
                        if !updated.remove_attribute(&m.attribute) {
                            return ResultCode::NoSuchAttribute;
                        }
                    } else {
                        for value in &m.values {
                            if !updated.remove_value(&m.attribute, value) {
                                return ResultCode::NoSuchAttribute;
                            }
                        }
                    }
                }
                ModificationType::Replace => {
                    updated.replace_attribute(&m.attribute, m.values.clone());
                }
            }
        }

        map.insert(dn.normalized().to_string(), updated);
        ResultCode::Success
    }

    fn modify_dn(
        &self,
        dn: &Dn,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> ResultCode {
        let mut map = self.entries.write();
        let Some(current) = map.get(dn.normalized()).cloned() else {
            return ResultCode::NoSuchObject;
        };

        let parent = match new_superior {
            Some(superior) => {
                if !map.contains_key(superior.normalized()) {
                    return ResultCode::NoSuchObject;
                }
                superior.clone()
            }
            None => dn.parent().unwrap_or_else(Dn::root),
        };
        let new_dn = match parent.child(new_rdn) {
            Ok(new_dn) => new_dn,
            Err(_) => return ResultCode::InvalidDnSyntax,
        };
        if new_dn != *dn && map.contains_key(new_dn.normalized()) {
            return ResultCode::EntryAlreadyExists;
        }
        if new_dn.is_descendant_of(dn) && new_dn != *dn {
            return ResultCode::UnwillingToPerform;
        }

        let mut renamed = current;
        if delete_old_rdn {
            for (attr, value) in dn.rdn_values() {
                renamed.remove_value(&attr, value.as_bytes());
            }
        }
        for (attr, value) in new_dn.rdn_values() {
            renamed.add_value(&attr, value.into_bytes());
        }

        // Move the subtree along with the entry
        let descendants: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.dn != *dn && e.dn.is_descendant_of(dn))
            .map(|(k, _)| k.clone())
            .collect();
        for key in descendants {
            if let Some(mut child) = map.remove(&key) {
                match child.dn.rebase(dn, &new_dn) {
                    Ok(moved) => {
                        child.dn = moved;
                        map.insert(child.dn.normalized().to_string(), child);
                    }
                    Err(_) => return ResultCode::Other,
                }
            }
        }

        map.remove(dn.normalized());
        renamed.dn = new_dn;
        map.insert(renamed.dn.normalized().to_string(), renamed);
        ResultCode::Success
    }
}

fn has_children(map: &BTreeMap<String, Entry>, dn: &Dn) -> bool {
    map.values()
        .any(|e| e.dn.depth() == dn.depth() + 1 && e.dn.is_descendant_of(dn))
}

impl Backend for MemoryBackend {
    fn handle(&self, request: &OperationRequest) -> ResultCode {
        match request {
            OperationRequest::Add { entry } => self.add(entry),
            OperationRequest::Delete { dn } => self.delete(dn),
            OperationRequest::Modify { dn, modifications } => self.modify(dn, modifications),
            OperationRequest::ModifyDn {
                dn,
                new_rdn,
                delete_old_rdn,
                new_superior,
            } => self.modify_dn(dn, new_rdn, *delete_old_rdn, new_superior.as_ref()),
        }
    }

    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        Ok(self.entries.read().get(dn.normalized()).cloned())
    }

    fn put_entry(&self, entry: Entry) -> Result<()> {
        self.entries
            .write()
            .insert(entry.dn.normalized().to_string(), entry);
        Ok(())
    }

    fn delete_entry(&self, dn: &Dn) -> Result<bool> {
        Ok(self.entries.write().remove(dn.normalized()).is_some())
    }

    fn iterate_entries(&self, base: &Dn) -> Result<Box<dyn Iterator<Item = Entry> + Send>> {
        let mut selected: Vec<Entry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.dn.is_descendant_of(base))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.dn.depth().cmp(&b.dn.depth()).then_with(|| a.dn.cmp(&b.dn)));
        Ok(Box::new(selected.into_iter()))
    }

    fn count_entries(&self, base: &Dn) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.dn.is_descendant_of(base))
            .count() as u64)
    }

    fn clear_subtree(&self, base: &Dn) -> Result<u64> {
        let mut map = self.entries.write();
        let before = map.len();
        map.retain(|_, e| !e.dn.is_descendant_of(base));
        Ok((before - map.len()) as u64)
    }

    fn set_inconsistent(&self, inconsistent: bool) {
        self.inconsistent.store(inconsistent, Ordering::SeqCst);
    }

    fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }
}
