//! Persisted domain state
//!
//! ServerState and generation ID survive restarts in
//! `<state_dir>/<domain>.state.json`. Writes go to a temporary file that is
//! renamed over the old one.

use crate::backend::Dn;
use crate::server_state::ServerState;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What is saved for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Domain base DN
    pub base_dn: Dn,
    /// Generation ID of the data set
    pub generation_id: i64,
    /// Newest applied CSN per replica
    pub server_state: ServerState,
    /// Set when an import was aborted
    #[serde(default)]
    pub inconsistent: bool,
}

/// JSON file holding a domain's [`PersistedState`]
#[derive(Debug, Clone)]
pub struct DomainStateStore {
    path: PathBuf,
}

impl DomainStateStore {
    /// Store for `base_dn` under `dir`
    pub fn new(dir: &Path, base_dn: &Dn) -> Self {
        Self {
            path: dir.join(format!("{}.state.json", base_dn.to_file_stem())),
        }
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state, `None` when nothing was saved yet
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            Error::internal(format!(
                "Corrupt state file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(state))
    }

    /// Save atomically
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::internal(format!("State serialization failed: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
