//! Point-in-time views.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::multi::MultiSegment;

use super::iterator::DbIterator;
use super::DbInner;

pub(crate) struct SnapshotInner {
    multi: RwLock<Option<Arc<MultiSegment>>>,
}

impl SnapshotInner {
    pub(crate) fn new(multi: Arc<MultiSegment>) -> Self {
        Self {
            multi: RwLock::new(Some(multi)),
        }
    }

    pub(crate) fn close(&self) {
        *self.multi.write() = None;
    }
}

/// Read-only view of the database at the moment it was taken. Later writes
/// are invisible to it. Dropping the snapshot closes it; the database also
/// force-closes outstanding snapshots when it closes.
pub struct Snapshot {
    db: Arc<DbInner>,
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub(crate) fn new(db: Arc<DbInner>, inner: Arc<SnapshotInner>) -> Self {
        Self { db, inner }
    }

    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.db.check_open()?;
        let multi = self.pinned()?;
        match multi.get(key)? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::KeyNotFound),
        }
    }

    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<DbIterator> {
        let multi = self.pinned()?;
        let iter = multi.lookup(lower, upper)?;
        Ok(DbIterator::new(iter, Arc::clone(&self.db)))
    }

    pub fn close(&self) {
        self.inner.close();
    }

    fn pinned(&self) -> Result<Arc<MultiSegment>> {
        self.inner
            .multi
            .read()
            .clone()
            .ok_or(Error::SnapshotClosed)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.inner.close();
    }
}
