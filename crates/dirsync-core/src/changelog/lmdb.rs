//! LMDB-backed changelog
//!
//! A single `changes` database keyed by `[replica:4 BE][csn:16]`, so one
//! replica's records are contiguous and sorted by CSN. Cursors read in small
//! batches, each in its own short read transaction.

use super::{ChangelogCursor, ChangelogDb, ChangelogRecord, order_violation};
use crate::csn::{CSN_KEY_LEN, Csn, flip_sign};
use crate::{Error, Result};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::Bound;
use std::path::{Path, PathBuf};

const KEY_LEN: usize = 4 + CSN_KEY_LEN;
const CURSOR_BATCH: usize = 256;

type ChangesDb = Database<Bytes, Bytes>;

fn record_key(replica_id: i32, csn: &Csn) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..4].copy_from_slice(&flip_sign(replica_id).to_be_bytes());
    key[4..].copy_from_slice(&csn.to_key());
    key
}

fn replica_bounds(replica_id: i32) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let mut low = [0u8; KEY_LEN];
    let mut high = [0xFFu8; KEY_LEN];
    let prefix = flip_sign(replica_id).to_be_bytes();
    low[..4].copy_from_slice(&prefix);
    high[..4].copy_from_slice(&prefix);
    (low, high)
}

fn split_key(key: &[u8]) -> Result<Csn> {
    if key.len() != KEY_LEN {
        return Err(Error::changelog(format!(
            "Changelog key has {} bytes, expected {}",
            key.len(),
            KEY_LEN
        )));
    }
    Csn::from_key(&key[4..])
}

#[derive(Default)]
struct Bounds {
    first: HashMap<i32, Csn>,
    last: HashMap<i32, Csn>,
    removed: bool,
}

/// LMDB B-tree changelog
pub struct LmdbChangelog {
    dir: PathBuf,
    env: Env,
    db: ChangesDb,
    bounds: Mutex<Bounds>,
}

impl LmdbChangelog {
    /// Open or create the changelog environment in `dir`
    pub fn open(dir: &Path, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let env = unsafe { EnvOpenOptions::new().map_size(map_size).max_dbs(1).open(dir)? };
        let mut wtxn = env.write_txn()?;
        let db: ChangesDb = env.create_database(&mut wtxn, Some("changes"))?;
        wtxn.commit()?;

        let mut bounds = Bounds::default();
        {
            let rtxn = env.read_txn()?;
            for item in db.iter(&rtxn)? {
                let (key, _) = item?;
                let csn = split_key(key)?;
                bounds.first.entry(csn.replica_id).or_insert(csn);
                bounds.last.insert(csn.replica_id, csn);
            }
        }
        tracing::debug!(
            "Opened LMDB changelog at {} with {} replicas",
            dir.display(),
            bounds.last.len()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            env,
            db,
            bounds: Mutex::new(bounds),
        })
    }

    fn first_stored(&self, replica_id: i32) -> Result<Option<Csn>> {
        let (low, high) = replica_bounds(replica_id);
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(&low[..]), Bound::Included(&high[..]));
        let mut iter = self.db.range(&rtxn, &range)?;
        match iter.next() {
            Some(item) => Ok(Some(split_key(item?.0)?)),
            None => Ok(None),
        }
    }
}

fn ensure_open(bounds: &Bounds) -> Result<()> {
    if bounds.removed {
        return Err(Error::changelog("Changelog was removed"));
    }
    Ok(())
}

impl ChangelogDb for LmdbChangelog {
    fn append(&self, replica_id: i32, csn: Csn, payload: &[u8]) -> Result<()> {
        let mut bounds = self.bounds.lock();
        ensure_open(&bounds)?;
        if let Some(last) = bounds.last.get(&replica_id).copied() {
            if csn <= last {
                return Err(order_violation(replica_id, last, csn));
            }
        }
        let mut wtxn = self.env.write_txn()?;
        self.db
            .put(&mut wtxn, &record_key(replica_id, &csn), payload)?;
        wtxn.commit()?;
        bounds.first.entry(replica_id).or_insert(csn);
        bounds.last.insert(replica_id, csn);
        Ok(())
    }

    fn cursor_from(&self, replica_id: i32, after: Option<Csn>) -> Result<ChangelogCursor> {
        ensure_open(&self.bounds.lock())?;
        let (low, high) = replica_bounds(replica_id);
        let start = match after {
            Some(csn) => Bound::Excluded(record_key(replica_id, &csn)),
            None => Bound::Included(low),
        };
        Ok(Box::new(LmdbCursor {
            env: self.env.clone(),
            db: self.db,
            start,
            end: high,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn purge_before(&self, csn: Csn) -> Result<u64> {
        let mut bounds = self.bounds.lock();
        ensure_open(&bounds)?;
        let replicas: Vec<(i32, Csn)> = bounds.last.iter().map(|(r, c)| (*r, *c)).collect();
        let mut purged = 0u64;
        let mut wtxn = self.env.write_txn()?;
        for (replica_id, last) in &replicas {
            let (low, _) = replica_bounds(*replica_id);
            // Never purge the newest record of a replica
            let limit = if csn > *last { *last } else { csn };
            let high = record_key(*replica_id, &limit);
            let range = (Bound::Included(&low[..]), Bound::Excluded(&high[..]));
            purged += self.db.delete_range(&mut wtxn, &range)? as u64;
        }
        wtxn.commit()?;
        drop(bounds);

        for (replica_id, _) in replicas {
            let first = self.first_stored(replica_id)?;
            let mut bounds = self.bounds.lock();
            match first {
                Some(first) => {
                    bounds.first.insert(replica_id, first);
                }
                None => {
                    bounds.first.remove(&replica_id);
                }
            }
        }
        if purged > 0 {
            tracing::debug!("Purged {} records before {} from {}", purged, csn, self.dir.display());
        }
        Ok(purged)
    }

    fn clear(&self) -> Result<()> {
        let mut bounds = self.bounds.lock();
        ensure_open(&bounds)?;
        let mut wtxn = self.env.write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        bounds.first.clear();
        bounds.last.clear();
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut bounds = self.bounds.lock();
        if bounds.removed {
            return Ok(());
        }
        let mut wtxn = self.env.write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        bounds.first.clear();
        bounds.last.clear();
        bounds.removed = true;
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn replica_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.bounds.lock().last.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn oldest_csn(&self, replica_id: i32) -> Option<Csn> {
        self.bounds.lock().first.get(&replica_id).copied()
    }

    fn newest_csn(&self, replica_id: i32) -> Option<Csn> {
        self.bounds.lock().last.get(&replica_id).copied()
    }
}

struct LmdbCursor {
    env: Env,
    db: ChangesDb,
    start: Bound<[u8; KEY_LEN]>,
    end: [u8; KEY_LEN],
    buffer: VecDeque<ChangelogRecord>,
    exhausted: bool,
}

impl LmdbCursor {
    fn fill(&mut self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        let start = match &self.start {
            Bound::Included(key) => Bound::Included(&key[..]),
            Bound::Excluded(key) => Bound::Excluded(&key[..]),
            Bound::Unbounded => Bound::Unbounded,
        };
        let range = (start, Bound::Included(&self.end[..]));
        let mut last_key = None;
        for item in self.db.range(&rtxn, &range)?.take(CURSOR_BATCH) {
            let (key, value) = item?;
            self.buffer.push_back(ChangelogRecord {
                csn: split_key(key)?,
                payload: value.to_vec(),
            });
            let mut copy = [0u8; KEY_LEN];
            copy.copy_from_slice(key);
            last_key = Some(copy);
        }
        match last_key {
            Some(key) if self.buffer.len() == CURSOR_BATCH => self.start = Bound::Excluded(key),
            _ => self.exhausted = true,
        }
        Ok(())
    }
}

impl Iterator for LmdbCursor {
    type Item = Result<ChangelogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_group_by_replica_then_csn() {
        let a = record_key(1, &Csn::new(500, 0, 1));
        let b = record_key(2, &Csn::new(1, 0, 2));
        let c = record_key(1, &Csn::new(501, 0, 1));
        assert!(a < c);
        assert!(c < b);
        let (low, high) = replica_bounds(1);
        assert!(low <= a && c <= high && b > high);
        assert_eq!(split_key(&a).unwrap(), Csn::new(500, 0, 1));
    }
}
