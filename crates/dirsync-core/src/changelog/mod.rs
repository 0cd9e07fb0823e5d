//! Changelog database of a replication server
//!
//! Every accepted update is appended here before it is forwarded. Records are
//! kept per replica in CSN order and read back through lazy cursors for
//! catch-up. Two interchangeable implementations exist:
//!
//! - [`FileChangelog`]: one append-only file per replica
//! - [`LmdbChangelog`]: a single LMDB B-tree keyed by `(replica, CSN)`

mod file;
mod lmdb;

pub use file::FileChangelog;
pub use lmdb::LmdbChangelog;

use crate::config::ChangelogBackendKind;
use crate::csn::Csn;
use crate::{Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;

/// One stored change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRecord {
    /// Change stamp
    pub csn: Csn,
    /// Serialized update
    pub payload: Vec<u8>,
}

/// Lazy ascending sequence of records of one replica
pub type ChangelogCursor = Box<dyn Iterator<Item = Result<ChangelogRecord>> + Send>;

/// Append-only, per-replica, CSN-ordered change store
pub trait ChangelogDb: Send + Sync {
    /// Append a record; durable on return
    ///
    /// A CSN not after the last one stored for `replica_id` is rejected with
    /// [`Error::ChangelogOrder`](crate::Error::ChangelogOrder).
    fn append(&self, replica_id: i32, csn: Csn, payload: &[u8]) -> Result<()>;

    /// Records of `replica_id` strictly after `after`, or all when `None`
    ///
    /// The cursor sees at least every record appended before the call.
    fn cursor_from(&self, replica_id: i32, after: Option<Csn>) -> Result<ChangelogCursor>;

    /// Drop records older than `csn`; the newest record of each replica stays
    fn purge_before(&self, csn: Csn) -> Result<u64>;

    /// Drop every record
    fn clear(&self) -> Result<()>;

    /// Delete the on-disk store; later calls fail
    fn remove(&self) -> Result<()>;

    /// Replicas with at least one record
    fn replica_ids(&self) -> Vec<i32>;

    /// Oldest stored CSN of a replica
    fn oldest_csn(&self, replica_id: i32) -> Option<Csn>;

    /// Newest stored CSN of a replica
    fn newest_csn(&self, replica_id: i32) -> Option<Csn>;
}

/// Open the configured changelog implementation under `dir`
pub fn open_changelog(
    kind: ChangelogBackendKind,
    dir: &Path,
    lmdb_map_size: usize,
) -> Result<Arc<dyn ChangelogDb>> {
    Ok(match kind {
        ChangelogBackendKind::File => Arc::new(FileChangelog::open(dir)?),
        ChangelogBackendKind::Lmdb => Arc::new(LmdbChangelog::open(dir, lmdb_map_size)?),
    })
}

/// Records of every replica merged into one ascending CSN sequence
///
/// Each replica's cursor starts after the CSN `after` returns for it. Only
/// the head record of each cursor is buffered.
pub struct MergedCursor {
    cursors: Vec<ChangelogCursor>,
    heads: Vec<Option<ChangelogRecord>>,
    order: BinaryHeap<Reverse<(Csn, usize)>>,
    failed: Option<Error>,
}

impl MergedCursor {
    /// Open one cursor per replica of `db`
    pub fn open<F>(db: &dyn ChangelogDb, after: F) -> Result<Self>
    where
        F: Fn(i32) -> Option<Csn>,
    {
        let mut merged = Self {
            cursors: Vec::new(),
            heads: Vec::new(),
            order: BinaryHeap::new(),
            failed: None,
        };
        for replica_id in db.replica_ids() {
            let cursor = db.cursor_from(replica_id, after(replica_id))?;
            merged.cursors.push(cursor);
            merged.heads.push(None);
            merged.advance(merged.cursors.len() - 1)?;
        }
        Ok(merged)
    }

    fn advance(&mut self, index: usize) -> Result<()> {
        match self.cursors[index].next() {
            Some(Ok(record)) => {
                self.order.push(Reverse((record.csn, index)));
                self.heads[index] = Some(record);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergedCursor {
    type Item = Result<ChangelogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            self.order.clear();
            return Some(Err(e));
        }
        let Reverse((_, index)) = self.order.pop()?;
        let record = self.heads[index].take()?;
        if let Err(e) = self.advance(index) {
            self.failed = Some(e);
        }
        Some(Ok(record))
    }
}

fn order_violation(replica_id: i32, last: Csn, attempted: Csn) -> Error {
    tracing::error!(
        "Changelog order violation for replica {}: {} is not after {}",
        replica_id,
        attempted,
        last
    );
    Error::ChangelogOrder {
        replica_id,
        last,
        attempted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn(ts: u64, replica: i32) -> Csn {
        Csn::new(ts, 0, replica)
    }

    fn collect(db: &dyn ChangelogDb, replica: i32, after: Option<Csn>) -> Vec<u64> {
        db.cursor_from(replica, after)
            .unwrap()
            .map(|r| r.unwrap().csn.timestamp)
            .collect()
    }

    fn suite_append_and_cursor(db: &dyn ChangelogDb) {
        for ts in 1..=5 {
            db.append(1, csn(ts, 1), format!("one-{}", ts).as_bytes())
                .unwrap();
        }
        db.append(2, csn(3, 2), b"two-3").unwrap();

        assert_eq!(collect(db, 1, None), vec![1, 2, 3, 4, 5]);
        assert_eq!(collect(db, 1, Some(csn(3, 1))), vec![4, 5]);
        assert_eq!(collect(db, 1, Some(csn(5, 1))), Vec::<u64>::new());
        assert_eq!(collect(db, 2, None), vec![3]);
        assert_eq!(collect(db, 9, None), Vec::<u64>::new());

        let first = db.cursor_from(1, None).unwrap().next().unwrap().unwrap();
        assert_eq!(first.payload, b"one-1".to_vec());

        let mut ids = db.replica_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(db.oldest_csn(1), Some(csn(1, 1)));
        assert_eq!(db.newest_csn(1), Some(csn(5, 1)));
        assert_eq!(db.newest_csn(7), None);
    }

    fn suite_rejects_out_of_order(db: &dyn ChangelogDb) {
        db.append(1, csn(10, 1), b"a").unwrap();
        let err = db.append(1, csn(10, 1), b"again").unwrap_err();
        assert!(matches!(err, Error::ChangelogOrder { replica_id: 1, .. }));
        assert!(db.append(1, csn(9, 1), b"older").is_err());
        // Other replicas are independent
        db.append(2, csn(1, 2), b"b").unwrap();
        assert_eq!(collect(db, 1, None), vec![10]);
    }

    fn suite_purge_and_clear(db: &dyn ChangelogDb) {
        for ts in 1..=6 {
            db.append(1, csn(ts, 1), b"x").unwrap();
        }
        db.append(2, csn(2, 2), b"y").unwrap();

        let purged = db.purge_before(csn(4, 1)).unwrap();
        assert_eq!(purged, 3);
        assert_eq!(collect(db, 1, None), vec![4, 5, 6]);
        // Newest record of replica 2 survives even though it is older
        assert_eq!(collect(db, 2, None), vec![2]);
        assert_eq!(db.oldest_csn(1), Some(csn(4, 1)));

        // Order check still applies after a purge
        assert!(db.append(1, csn(5, 1), b"z").is_err());
        db.append(1, csn(7, 1), b"z").unwrap();

        db.clear().unwrap();
        assert!(db.replica_ids().is_empty());
        assert_eq!(collect(db, 1, None), Vec::<u64>::new());
        db.append(1, csn(1, 1), b"fresh").unwrap();
        assert_eq!(collect(db, 1, None), vec![1]);
    }

    fn suite_cursor_is_lazy_and_restartable(db: &dyn ChangelogDb) {
        for ts in 1..=600 {
            db.append(3, csn(ts, 3), &[0u8; 64]).unwrap();
        }
        let mut cursor = db.cursor_from(3, None).unwrap();
        let mut last = None;
        for _ in 0..250 {
            last = Some(cursor.next().unwrap().unwrap().csn);
        }
        drop(cursor);
        let rest: Vec<_> = db
            .cursor_from(3, last)
            .unwrap()
            .map(|r| r.unwrap().csn.timestamp)
            .collect();
        assert_eq!(rest.len(), 350);
        assert_eq!(rest.first(), Some(&251));
    }

    fn suite_merged_cursor_interleaves_replicas(db: &dyn ChangelogDb) {
        for ts in [1, 4, 5] {
            db.append(11, csn(ts, 11), b"eleven").unwrap();
        }
        for ts in [2, 3, 6] {
            db.append(12, csn(ts, 12), b"twelve").unwrap();
        }
        db.append(13, Csn::new(4, 0, 13), b"thirteen").unwrap();

        let all: Vec<Csn> = MergedCursor::open(db, |_| None)
            .unwrap()
            .map(|r| r.unwrap().csn)
            .collect();
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
        assert_eq!(all.len(), 7);
        assert_eq!(all[3], csn(4, 11));
        assert_eq!(all[4], Csn::new(4, 0, 13));

        let resumed: Vec<(u64, i32)> = MergedCursor::open(db, |replica| match replica {
            11 => Some(csn(4, 11)),
            12 => Some(csn(3, 12)),
            _ => None,
        })
        .unwrap()
        .map(|r| {
            let csn = r.unwrap().csn;
            (csn.timestamp, csn.replica_id)
        })
        .collect();
        assert_eq!(resumed, vec![(4, 13), (5, 11), (6, 12)]);
    }

    fn suite_remove(db: &dyn ChangelogDb, dir: &Path) {
        db.append(1, csn(1, 1), b"x").unwrap();
        db.remove().unwrap();
        assert!(!dir.exists());
        assert!(db.append(1, csn(2, 1), b"y").is_err());
    }

    macro_rules! changelog_suite {
        ($module:ident, $open:expr) => {
            mod $module {
                use super::*;

                #[test]
                fn append_and_cursor() {
                    let dir = tempfile::tempdir().unwrap();
                    let db = $open(dir.path());
                    suite_append_and_cursor(&*db);
                }

                #[test]
                fn rejects_out_of_order() {
                    let dir = tempfile::tempdir().unwrap();
                    let db = $open(dir.path());
                    suite_rejects_out_of_order(&*db);
                }

                #[test]
                fn purge_and_clear() {
                    let dir = tempfile::tempdir().unwrap();
                    let db = $open(dir.path());
                    suite_purge_and_clear(&*db);
                }

                #[test]
                fn cursor_is_lazy_and_restartable() {
                    let dir = tempfile::tempdir().unwrap();
                    let db = $open(dir.path());
                    suite_cursor_is_lazy_and_restartable(&*db);
                }

                #[test]
                fn merged_cursor_interleaves_replicas() {
                    let dir = tempfile::tempdir().unwrap();
                    let db = $open(dir.path());
                    suite_merged_cursor_interleaves_replicas(&*db);
                }

                #[test]
                fn reopen_keeps_records() {
                    let dir = tempfile::tempdir().unwrap();
                    {
                        let db = $open(dir.path());
                        db.append(1, csn(1, 1), b"a").unwrap();
                        db.append(1, csn(2, 1), b"b").unwrap();
                    }
                    let db = $open(dir.path());
                    assert_eq!(collect(&*db, 1, None), vec![1, 2]);
                    assert_eq!(db.newest_csn(1), Some(csn(2, 1)));
                    assert!(db.append(1, csn(2, 1), b"dup").is_err());
                }

                #[test]
                fn remove_deletes_directory() {
                    let parent = tempfile::tempdir().unwrap();
                    let dir = parent.path().join("changelog");
                    let db = $open(&dir);
                    suite_remove(&*db, &dir);
                }
            }
        };
    }

    changelog_suite!(file_log, |dir: &Path| -> Arc<dyn ChangelogDb> {
        open_changelog(ChangelogBackendKind::File, dir, 0).unwrap()
    });

    changelog_suite!(lmdb_log, |dir: &Path| -> Arc<dyn ChangelogDb> {
        open_changelog(ChangelogBackendKind::Lmdb, dir, 64 * 1024 * 1024).unwrap()
    });
}
