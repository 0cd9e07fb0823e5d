//! File-backed changelog
//!
//! One file per replica, `replica-<id>.log`, holding records
//! `[len:4 LE][csn:16][payload][crc32:4 LE]` where the CRC covers the CSN
//! and the payload. Appends are fsynced. A torn or corrupt tail left by a
//! crash is truncated on open.

use super::{ChangelogCursor, ChangelogDb, ChangelogRecord, order_violation};
use crate::csn::{CSN_KEY_LEN, Csn};
use crate::protocol::codec::MAX_PAYLOAD_LEN;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

const LEN_LEN: usize = 4;
const CRC_LEN: usize = 4;
const RECORD_OVERHEAD: u64 = (LEN_LEN + CSN_KEY_LEN + CRC_LEN) as u64;

struct ReplicaFile {
    path: PathBuf,
    file: File,
    len: u64,
    first: Option<Csn>,
    last: Option<Csn>,
}

struct FileState {
    replicas: HashMap<i32, ReplicaFile>,
    removed: bool,
}

/// Append-only file per replica
pub struct FileChangelog {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl FileChangelog {
    /// Open or create the changelog in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut replicas = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(replica_id) = replica_of(&path) else {
                continue;
            };
            let replica = recover(&path)?;
            replicas.insert(replica_id, replica);
        }
        tracing::debug!(
            "Opened file changelog at {} with {} replicas",
            dir.display(),
            replicas.len()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(FileState {
                replicas,
                removed: false,
            }),
        })
    }

    fn replica_path(&self, replica_id: i32) -> PathBuf {
        self.dir.join(format!("replica-{}.log", replica_id))
    }
}

fn replica_of(path: &Path) -> Option<i32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("replica-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

fn encode_record(csn: Csn, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD as usize + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let key = csn.to_key();
    buf.extend_from_slice(&key);
    buf.extend_from_slice(payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key);
    hasher.update(payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

/// Read one record; `Ok(None)` at a clean end of file
fn read_record(reader: &mut impl Read) -> Result<Option<(ChangelogRecord, u64)>> {
    let mut len_buf = [0u8; LEN_LEN];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::changelog(format!("Record length {} is too large", len)));
    }
    let mut key = [0u8; CSN_KEY_LEN];
    reader.read_exact(&mut key)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut crc_buf = [0u8; CRC_LEN];
    reader.read_exact(&mut crc_buf)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key);
    hasher.update(&payload);
    if hasher.finalize() != u32::from_le_bytes(crc_buf) {
        return Err(Error::changelog("Record checksum mismatch"));
    }
    let record = ChangelogRecord {
        csn: Csn::from_key(&key)?,
        payload,
    };
    Ok(Some((record, RECORD_OVERHEAD + len as u64)))
}

/// Scan a replica file, truncating anything after the last valid record
fn recover(path: &Path) -> Result<ReplicaFile> {
    let file = OpenOptions::new().read(true).append(true).open(path)?;
    let physical_len = file.metadata()?.len();
    let mut reader = BufReader::new(file.try_clone()?);
    let mut len = 0u64;
    let mut first = None;
    let mut last = None;
    loop {
        match read_record(&mut reader) {
            Ok(Some((record, size))) => {
                if last.is_some_and(|l| record.csn <= l) {
                    tracing::warn!("Out of order record in {}, truncating", path.display());
                    break;
                }
                first.get_or_insert(record.csn);
                last = Some(record.csn);
                len += size;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    "Torn record at offset {} of {} ({}), truncating",
                    len,
                    path.display(),
                    e
                );
                break;
            }
        }
    }
    if len < physical_len {
        file.set_len(len)?;
        file.sync_data()?;
    }
    Ok(ReplicaFile {
        path: path.to_path_buf(),
        file,
        len,
        first,
        last,
    })
}

fn ensure_open(state: &FileState) -> Result<()> {
    if state.removed {
        return Err(Error::changelog("Changelog was removed"));
    }
    Ok(())
}

impl ChangelogDb for FileChangelog {
    fn append(&self, replica_id: i32, csn: Csn, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        if !state.replicas.contains_key(&replica_id) {
            let path = self.replica_path(replica_id);
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            state.replicas.insert(
                replica_id,
                ReplicaFile {
                    path,
                    file,
                    len: 0,
                    first: None,
                    last: None,
                },
            );
        }
        let Some(replica) = state.replicas.get_mut(&replica_id) else {
            return Err(Error::internal("Replica file vanished"));
        };
        if let Some(last) = replica.last {
            if csn <= last {
                return Err(order_violation(replica_id, last, csn));
            }
        }
        let record = encode_record(csn, payload);
        replica.file.write_all(&record)?;
        replica.file.sync_data()?;
        replica.len += record.len() as u64;
        replica.first.get_or_insert(csn);
        replica.last = Some(csn);
        Ok(())
    }

    fn cursor_from(&self, replica_id: i32, after: Option<Csn>) -> Result<ChangelogCursor> {
        let state = self.state.lock();
        ensure_open(&state)?;
        let Some(replica) = state.replicas.get(&replica_id) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let file = File::open(&replica.path)?;
        Ok(Box::new(FileCursor {
            reader: BufReader::new(file),
            remaining: replica.len,
            after,
            failed: false,
        }))
    }

    fn purge_before(&self, csn: Csn) -> Result<u64> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        let mut purged = 0u64;
        for replica in state.replicas.values_mut() {
            let Some(last) = replica.last else {
                continue;
            };
            if replica.first.is_none_or(|first| first >= csn) {
                continue;
            }

            let mut reader = BufReader::new(File::open(&replica.path)?);
            let mut kept = Vec::new();
            let mut first = None;
            let mut consumed = 0u64;
            while consumed < replica.len {
                let Some((record, size)) = read_record(&mut reader)? else {
                    break;
                };
                consumed += size;
                if record.csn < csn && record.csn != last {
                    purged += 1;
                    continue;
                }
                first.get_or_insert(record.csn);
                kept.extend_from_slice(&encode_record(record.csn, &record.payload));
            }

            let tmp = replica.path.with_extension("log.tmp");
            {
                let mut out = File::create(&tmp)?;
                out.write_all(&kept)?;
                out.sync_data()?;
            }
            std::fs::rename(&tmp, &replica.path)?;
            replica.file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(&replica.path)?;
            replica.len = kept.len() as u64;
            replica.first = first;
        }
        if purged > 0 {
            tracing::debug!("Purged {} records before {} from {}", purged, csn, self.dir.display());
        }
        Ok(purged)
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        for (_, replica) in state.replicas.drain() {
            std::fs::remove_file(&replica.path)?;
        }
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.removed {
            return Ok(());
        }
        state.replicas.clear();
        state.removed = true;
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn replica_ids(&self) -> Vec<i32> {
        let state = self.state.lock();
        let mut ids: Vec<i32> = state
            .replicas
            .iter()
            .filter(|(_, r)| r.last.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn oldest_csn(&self, replica_id: i32) -> Option<Csn> {
        self.state.lock().replicas.get(&replica_id)?.first
    }

    fn newest_csn(&self, replica_id: i32) -> Option<Csn> {
        self.state.lock().replicas.get(&replica_id)?.last
    }
}

struct FileCursor {
    reader: BufReader<File>,
    remaining: u64,
    after: Option<Csn>,
    failed: bool,
}

impl Iterator for FileCursor {
    type Item = Result<ChangelogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.remaining > 0 {
            match read_record(&mut self.reader) {
                Ok(Some((record, size))) => {
                    self.remaining = self.remaining.saturating_sub(size);
                    if self.after.is_some_and(|after| record.csn <= after) {
                        continue;
                    }
                    return Some(Ok(record));
                }
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
