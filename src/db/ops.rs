//! Read and write paths.
//!
//! Mutations hold the write lock only for the skip-list insert and log
//! append; reads go through the atomically published state and never block
//! writers.

use std::sync::Arc;

use bytes::Bytes;

use crate::disk::MAX_KEY_SIZE;
use crate::error::{Error, Result};
use crate::memory::MemorySegment;
use crate::merger::merge_segments;
use crate::multi::MultiSegment;
use crate::segment::Segment;

use super::iterator::DbIterator;
use super::snapshot::{Snapshot, SnapshotInner};
use super::{Db, DbInner, Stats, WriteBatch};

fn validate_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLong);
    }
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    Ok(())
}

impl Db {
    /// Returns the value for `key`, or [`Error::KeyNotFound`] when the key
    /// is absent or removed.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let inner = &self.inner;
        inner.check_open()?;
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLong);
        }

        match inner.multi()?.get(key)? {
            Some(value) if !value.is_empty() => Ok(value),
            // An empty value is a tombstone and never escapes the engine.
            _ => Err(Error::KeyNotFound),
        }
    }

    /// Stores `value` under `key`, replacing any existing entry. Empty keys
    /// and keys longer than 1024 bytes are rejected.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let inner = &self.inner;
        {
            let _guard = inner.write_lock.lock();
            inner.check_open()?;
            validate_key(&key)?;

            inner.maybe_swap_memory();
            inner.memory()?.put(key, value)?;
        }
        inner.maybe_merge()
    }

    /// Removes `key`, returning the value it had. Removing an absent key
    /// fails with [`Error::KeyNotFound`] and writes nothing.
    pub fn remove(&self, key: &[u8]) -> Result<Bytes> {
        let inner = &self.inner;
        let previous = {
            let _guard = inner.write_lock.lock();
            inner.check_open()?;
            validate_key(key)?;

            let previous = match inner.multi()?.get(key)? {
                Some(value) if !value.is_empty() => value,
                _ => return Err(Error::KeyNotFound),
            };

            inner.maybe_swap_memory();
            inner.memory()?.remove(Bytes::copy_from_slice(key))?;
            previous
        };
        inner.maybe_merge()?;
        Ok(previous)
    }

    /// Applies a batch atomically: recovery replays either the whole batch
    /// or none of it, and validation rejects the batch before any entry is
    /// applied.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        // An empty batch would journal a zero-length marker, which replay
        // could not tell from a record header.
        if batch.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        {
            let _guard = inner.write_lock.lock();
            inner.check_open()?;
            for (key, _) in &batch.entries {
                validate_key(key)?;
            }

            inner.maybe_swap_memory();
            inner.memory()?.write(&batch)?;
        }
        inner.maybe_merge()
    }

    /// Ordered iteration over live keys in `[lower, upper]`; either bound
    /// may be `None` for an unbounded side. Removed keys are skipped.
    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<DbIterator> {
        let inner = &self.inner;
        inner.check_open()?;
        let iter = inner.multi()?.lookup(lower, upper)?;
        Ok(DbIterator::new(iter, Arc::clone(inner)))
    }

    /// Freezes the current view and returns it as a stable snapshot. The
    /// snapshot never observes later writes.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let inner = &self.inner;
        let _guard = inner.write_lock.lock();
        inner.check_open()?;

        let state = inner.current_state();
        let memory = state.memory.clone().ok_or(Error::DatabaseClosed)?;

        // Freeze the head segment; the snapshot sees everything up to and
        // including it, but not the fresh segment that replaces it.
        let mut segments = state.segments.clone();
        segments.push(Segment::Memory(memory));
        let frozen = Arc::new(MultiSegment::new(segments.clone(), inner.cmp.clone()));

        let fresh = Arc::new(MemorySegment::new(
            Some(inner.path.clone()),
            inner.next_segment_id(),
            inner.options.clone(),
        ));
        inner.publish_state_locked(segments, Some(fresh));

        let snapshot = Arc::new(SnapshotInner::new(frozen));
        inner.register_snapshot(&snapshot);
        Ok(Snapshot::new(Arc::clone(inner), snapshot))
    }

    pub fn stats(&self) -> Result<Stats> {
        self.inner.check_open()?;
        Ok(Stats {
            num_segments: self.inner.current_state().segments.len(),
        })
    }
}

impl DbInner {
    fn multi(&self) -> Result<Arc<MultiSegment>> {
        self.current_state()
            .multi
            .clone()
            .ok_or(Error::DatabaseClosed)
    }

    fn memory(&self) -> Result<Arc<MemorySegment>> {
        self.current_state()
            .memory
            .clone()
            .ok_or(Error::DatabaseClosed)
    }

    /// Freezes the head memory segment once it outgrows the configured
    /// threshold and starts a fresh one. Caller holds the write lock.
    fn maybe_swap_memory(&self) {
        let state = self.current_state();
        let Some(memory) = &state.memory else {
            return;
        };
        if memory.size() <= self.options.max_memory_bytes {
            return;
        }

        let mut segments = state.segments.clone();
        segments.push(Segment::Memory(Arc::clone(memory)));
        let fresh = Arc::new(MemorySegment::new(
            Some(self.path.clone()),
            self.next_segment_id(),
            self.options.clone(),
        ));
        self.publish_state_locked(segments, Some(fresh));
    }

    /// Foreground backpressure: once the stack runs past twice the cap, the
    /// mutating thread pays for a merge pass before returning.
    fn maybe_merge(&self) -> Result<()> {
        if self.options.disable_auto_merge {
            return Ok(());
        }
        if self.current_state().segments.len() > 2 * self.options.max_segments {
            merge_segments(self, self.options.max_segments)?;
        }
        Ok(())
    }
}
