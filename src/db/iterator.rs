//! Public range iterator.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::multi::MultiIter;

use super::DbInner;

/// Ordered iterator over live records, ascending by key. Obtained from
/// [`crate::Db::lookup`] or [`crate::Snapshot::lookup`].
///
/// Tombstones are filtered here: a key removed in a newer segment never
/// surfaces even when an older segment still holds a value for it.
pub struct DbIterator {
    iter: MultiIter,
    db: Arc<DbInner>,
}

impl DbIterator {
    pub(crate) fn new(iter: MultiIter, db: Arc<DbInner>) -> Self {
        Self { iter, db }
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.db.open.load(Ordering::Acquire) {
                return Some(Err(Error::DatabaseClosed));
            }
            match self.iter.next()? {
                Err(err) => return Some(Err(err)),
                Ok((_, value)) if value.is_empty() => continue,
                Ok(record) => return Some(Ok(record)),
            }
        }
    }
}
