//! Entry storage collaborator
//!
//! The replication core never touches on-disk entry formats. It talks to a
//! [`Backend`] through one request entry point plus a handful of bulk helpers
//! used by total update.

mod dn;
mod entry;
mod memory;

pub use dn::Dn;
pub use entry::Entry;
pub use memory::MemoryBackend;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// Operation applied
    Success,
    /// Target entry (or its parent) does not exist
    NoSuchObject,
    /// An entry with this DN already exists
    EntryAlreadyExists,
    /// Delete or rename of an entry that has children
    NotAllowedOnNonLeaf,
    /// Added value already present
    AttributeOrValueExists,
    /// Removed attribute or value absent
    NoSuchAttribute,
    /// Server refuses to perform the request
    UnwillingToPerform,
    /// Malformed DN
    InvalidDnSyntax,
    /// Operation exceeded its time limit
    TimeLimitExceeded,
    /// Anything else
    Other,
}

impl ResultCode {
    /// LDAP numeric result code
    pub fn code(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::Other => 80,
        }
    }

    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }
}

/// Kind of attribute modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationType {
    /// Add values
    Add,
    /// Delete listed values, or the whole attribute when none are listed
    Delete,
    /// Replace all values
    Replace,
}

/// One attribute modification of a Modify request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Modification kind
    pub kind: ModificationType,
    /// Attribute name
    pub attribute: String,
    /// Values involved
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    /// Add text values
    pub fn add(attribute: &str, values: &[&str]) -> Self {
        Self::text(ModificationType::Add, attribute, values)
    }

    /// Delete text values (none: the whole attribute)
    pub fn delete(attribute: &str, values: &[&str]) -> Self {
        Self::text(ModificationType::Delete, attribute, values)
    }

    /// Replace with text values
    pub fn replace(attribute: &str, values: &[&str]) -> Self {
        Self::text(ModificationType::Replace, attribute, values)
    }

    fn text(kind: ModificationType, attribute: &str, values: &[&str]) -> Self {
        Self {
            kind,
            attribute: attribute.to_string(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }
}

/// A write request coming from the LDAP front end or from replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationRequest {
    /// Add an entry
    Add {
        /// Entry to add
        entry: Entry,
    },
    /// Delete a leaf entry
    Delete {
        /// Target
        dn: Dn,
    },
    /// Modify attributes of an entry
    Modify {
        /// Target
        dn: Dn,
        /// Applied in order, atomically
        modifications: Vec<Modification>,
    },
    /// Rename and/or move an entry
    ModifyDn {
        /// Target
        dn: Dn,
        /// New leftmost RDN, e.g. `cn=new`
        new_rdn: String,
        /// Remove the old RDN values from the entry
        delete_old_rdn: bool,
        /// New parent, when moving
        new_superior: Option<Dn>,
    },
}

impl OperationRequest {
    /// Target DN of the request
    pub fn dn(&self) -> &Dn {
        match self {
            OperationRequest::Add { entry } => &entry.dn,
            OperationRequest::Delete { dn }
            | OperationRequest::Modify { dn, .. }
            | OperationRequest::ModifyDn { dn, .. } => dn,
        }
    }

    /// Short operation name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OperationRequest::Add { .. } => "add",
            OperationRequest::Delete { .. } => "delete",
            OperationRequest::Modify { .. } => "modify",
            OperationRequest::ModifyDn { .. } => "modifyDN",
        }
    }
}

/// Entry storage engine
pub trait Backend: Send + Sync {
    /// Apply a write request with LDAP semantics
    fn handle(&self, request: &OperationRequest) -> ResultCode;

    /// Fetch one entry
    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>>;

    /// Store an entry unconditionally, replacing any previous one
    fn put_entry(&self, entry: Entry) -> Result<()>;

    /// Remove one entry; false when it did not exist
    fn delete_entry(&self, dn: &Dn) -> Result<bool>;

    /// Entries at or below `base`, parents before children
    fn iterate_entries(&self, base: &Dn) -> Result<Box<dyn Iterator<Item = Entry> + Send>>;

    /// Number of entries at or below `base`
    fn count_entries(&self, base: &Dn) -> Result<u64>;

    /// Remove `base` and everything below it; returns the number removed
    fn clear_subtree(&self, base: &Dn) -> Result<u64>;

    /// Flag the data as unusable after an aborted import
    fn set_inconsistent(&self, inconsistent: bool);

    /// Whether an aborted import left the data unusable
    fn is_inconsistent(&self) -> bool;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn handle(&self, request: &OperationRequest) -> ResultCode {
        (**self).handle(request)
    }

    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        (**self).get_entry(dn)
    }

    fn put_entry(&self, entry: Entry) -> Result<()> {
        (**self).put_entry(entry)
    }

    fn delete_entry(&self, dn: &Dn) -> Result<bool> {
        (**self).delete_entry(dn)
    }

    fn iterate_entries(&self, base: &Dn) -> Result<Box<dyn Iterator<Item = Entry> + Send>> {
        (**self).iterate_entries(base)
    }

    fn count_entries(&self, base: &Dn) -> Result<u64> {
        (**self).count_entries(base)
    }

    fn clear_subtree(&self, base: &Dn) -> Result<u64> {
        (**self).clear_subtree(base)
    }

    fn set_inconsistent(&self, inconsistent: bool) {
        (**self).set_inconsistent(inconsistent)
    }

    fn is_inconsistent(&self) -> bool {
        (**self).is_inconsistent()
    }
}

/// Interception function: `Some(code)` short-circuits the request
pub type InterceptFn = Arc<dyn Fn(&OperationRequest) -> Option<ResultCode> + Send + Sync>;

/// Decorator that runs an interception function before delegating
pub struct Intercept<B> {
    inner: B,
    hook: InterceptFn,
}

impl<B: Backend> Intercept<B> {
    /// Wrap `inner`
    pub fn new(inner: B, hook: InterceptFn) -> Self {
        Self { inner, hook }
    }

    /// Wrapped backend
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Backend> Backend for Intercept<B> {
    fn handle(&self, request: &OperationRequest) -> ResultCode {
        match (self.hook)(request) {
            Some(code) => {
                tracing::debug!(
                    "Intercepted {} on {}: {:?}",
                    request.kind(),
                    request.dn(),
                    code
                );
                code
            }
            None => self.inner.handle(request),
        }
    }

    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        self.inner.get_entry(dn)
    }

    fn put_entry(&self, entry: Entry) -> Result<()> {
        self.inner.put_entry(entry)
    }

    fn delete_entry(&self, dn: &Dn) -> Result<bool> {
        self.inner.delete_entry(dn)
    }

    fn iterate_entries(&self, base: &Dn) -> Result<Box<dyn Iterator<Item = Entry> + Send>> {
        self.inner.iterate_entries(base)
    }

    fn count_entries(&self, base: &Dn) -> Result<u64> {
        self.inner.count_entries(base)
    }

    fn clear_subtree(&self, base: &Dn) -> Result<u64> {
        self.inner.clear_subtree(base)
    }

    fn set_inconsistent(&self, inconsistent: bool) {
        self.inner.set_inconsistent(inconsistent)
    }

    fn is_inconsistent(&self) -> bool {
        self.inner.is_inconsistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_intercept_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let backend = Intercept::new(
            MemoryBackend::new(),
            Arc::new(move |request: &OperationRequest| {
                seen.fetch_add(1, Ordering::SeqCst);
                match request {
                    OperationRequest::Delete { .. } => Some(ResultCode::UnwillingToPerform),
                    _ => None,
                }
            }),
        );

        let dn = Dn::parse("dc=example,dc=com").unwrap();
        let add = OperationRequest::Add {
            entry: Entry::new(dn.clone()).with_attribute("dc", "example"),
        };
        assert_eq!(backend.handle(&add), ResultCode::Success);
        assert_eq!(
            backend.handle(&OperationRequest::Delete { dn: dn.clone() }),
            ResultCode::UnwillingToPerform
        );
        assert!(backend.get_entry(&dn).unwrap().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_result_code_numbers() {
        assert_eq!(ResultCode::Success.code(), 0);
        assert_eq!(ResultCode::NoSuchObject.code(), 32);
        assert!(!ResultCode::Other.is_success());
    }
}
