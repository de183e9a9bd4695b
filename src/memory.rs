//! The writable segment: a skip list backed by an append-only log.
//!
//! An empty value marks a key as removed. The log file is created lazily on
//! the first write so an idle database leaves no empty logs behind.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::db::options::{KeyCompare, Options};
use crate::db::WriteBatch;
use crate::error::Result;
use crate::log::LogFile;
use crate::skiplist::{SkipIter, SkipList};

pub(crate) struct MemorySegment {
    list: Arc<SkipList>,
    log: Mutex<Option<LogFile>>,
    id: u64,
    dir: Option<PathBuf>,
    options: Options,
    cmp: KeyCompare,
    /// Approximate keys+values footprint; replacements subtract the
    /// superseded record.
    bytes: AtomicI64,
    remove_on_drop: AtomicBool,
}

impl MemorySegment {
    pub fn new(dir: Option<PathBuf>, id: u64, options: Options) -> Self {
        let cmp = options.key_compare();
        Self {
            list: Arc::new(SkipList::new(cmp.clone())),
            log: Mutex::new(None),
            id,
            dir,
            options,
            cmp,
            bytes: AtomicI64::new(0),
            remove_on_drop: AtomicBool::new(false),
        }
    }

    /// Segment with no persistence, for tests.
    #[cfg(test)]
    pub fn memory_only() -> Self {
        Self::new(None, 0, Options::default())
    }

    pub fn lower_id(&self) -> u64 {
        self.id
    }

    pub fn upper_id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.bytes.load(AtomicOrdering::Relaxed).max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        let mut iter = self.list.iter();
        iter.seek_to_first();
        !iter.valid()
    }

    pub fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        let mut log = self.log.lock();
        self.maybe_create_log(&mut log)?;

        let prev = self.list.put(key.clone(), value.clone());
        let mut delta = key.len() as i64 + value.len() as i64;
        if let Some((prev_key, prev_value)) = &prev {
            delta -= prev_key.len() as i64 + prev_value.len() as i64;
        }
        self.bytes.fetch_add(delta, AtomicOrdering::Relaxed);

        if let Some(log) = log.as_mut() {
            log.write(&key, &value)?;
        }
        Ok(prev.map(|(_, value)| value))
    }

    pub fn remove(&self, key: Bytes) -> Result<Option<Bytes>> {
        self.put(key, Bytes::new())
    }

    /// Applies a batch under a single log batch bracket, so recovery treats
    /// it atomically.
    pub fn write(&self, batch: &WriteBatch) -> Result<()> {
        let mut log = self.log.lock();
        self.maybe_create_log(&mut log)?;

        if let Some(log) = log.as_mut() {
            log.start_batch(batch.entries.len())?;
        }
        for (key, value) in &batch.entries {
            let prev = self.list.put(key.clone(), value.clone());
            let mut delta = key.len() as i64 + value.len() as i64;
            if let Some((prev_key, prev_value)) = &prev {
                delta -= prev_key.len() as i64 + prev_value.len() as i64;
            }
            self.bytes.fetch_add(delta, AtomicOrdering::Relaxed);
            if let Some(log) = log.as_mut() {
                log.write(key, value)?;
            }
        }
        if let Some(log) = log.as_mut() {
            log.end_batch(batch.entries.len())?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.list.get(key)
    }

    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> MemIter {
        MemIter::new(&self.list, lower, upper, self.cmp.clone())
    }

    pub fn close(&self) -> Result<()> {
        if let Some(log) = self.log.lock().as_mut() {
            log.close()?;
        }
        Ok(())
    }

    pub fn files(&self) -> Vec<String> {
        match self.log.lock().as_ref() {
            Some(log) => vec![log
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()],
            None => Vec::new(),
        }
    }

    pub fn mark_remove_on_drop(&self) {
        self.remove_on_drop.store(true, AtomicOrdering::Relaxed);
    }

    /// Closes and deletes the backing log, if one was ever created.
    pub fn remove_files(&self) -> Result<()> {
        let mut guard = self.log.lock();
        if let Some(mut log) = guard.take() {
            log.close()?;
            let path = log.path().to_path_buf();
            drop(log);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn maybe_create_log(&self, log: &mut Option<LogFile>) -> Result<()> {
        if log.is_some() {
            return Ok(());
        }
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        *log = Some(LogFile::create(dir, self.id, &self.options)?);
        Ok(())
    }
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        if self.remove_on_drop.load(AtomicOrdering::Relaxed) {
            let _ = self.remove_files();
        }
    }
}

/// Bounded forward iterator over a skip list. Shared by memory and log
/// segments.
pub(crate) struct MemIter {
    iter: SkipIter,
    upper: Option<Bytes>,
    cmp: KeyCompare,
    done: bool,
}

impl MemIter {
    pub(crate) fn new(
        list: &Arc<SkipList>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        cmp: KeyCompare,
    ) -> Self {
        let mut iter = list.iter();
        match lower {
            Some(lower) => iter.seek(lower),
            None => iter.seek_to_first(),
        }
        Self {
            iter,
            upper: upper.map(Bytes::copy_from_slice),
            cmp,
            done: false,
        }
    }
}

impl Iterator for MemIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || !self.iter.valid() {
            return None;
        }
        let key = self.iter.key().clone();
        if let Some(upper) = &self.upper {
            if (self.cmp)(&key, upper) == Ordering::Greater {
                self.done = true;
                return None;
            }
        }
        let value = self.iter.value();
        self.iter.next();
        Some(Ok((key, value)))
    }
}
