//! Segment handles and on-disk naming.
//!
//! A segment is a sorted batch of key/value records identified by a
//! `(lower, upper)` ID range. Memory segments are the only writable kind;
//! writes reach them directly through the database facade, so the shared
//! surface here is read-only by construction.

use std::sync::Arc;

use bytes::Bytes;

use crate::disk::{DiskIter, DiskSegment};
use crate::error::Result;
use crate::logseg::LogSegment;
use crate::memory::{MemIter, MemorySegment};

pub(crate) fn keys_file_name(lower: u64, upper: u64) -> String {
    format!("keys.{lower}.{upper}")
}

pub(crate) fn data_file_name(lower: u64, upper: u64) -> String {
    format!("data.{lower}.{upper}")
}

/// Parses `log.<id>`. Malformed names are a programmer error: the directory
/// was validated at open.
pub(crate) fn segment_id(filename: &str) -> u64 {
    let mut parts = filename.split('.');
    let _prefix = parts.next();
    parts
        .next()
        .and_then(|id| id.parse().ok())
        .unwrap_or_else(|| panic!("invalid segment filename {filename}"))
}

/// Parses `keys.<lower>.<upper>` / `data.<lower>.<upper>`.
pub(crate) fn segment_ids(filename: &str) -> (u64, u64) {
    let mut parts = filename.split('.');
    let _prefix = parts.next();
    let lower = parts.next().and_then(|id| id.parse().ok());
    let upper = parts.next().and_then(|id| id.parse().ok());
    match (lower, upper) {
        (Some(lower), Some(upper)) => (lower, upper),
        _ => panic!("invalid segment filename {filename}"),
    }
}

#[derive(Clone)]
pub(crate) enum Segment {
    Memory(Arc<MemorySegment>),
    Log(Arc<LogSegment>),
    Disk(Arc<DiskSegment>),
}

impl Segment {
    pub fn lower_id(&self) -> u64 {
        match self {
            Segment::Memory(seg) => seg.lower_id(),
            Segment::Log(seg) => seg.lower_id(),
            Segment::Disk(seg) => seg.lower_id(),
        }
    }

    pub fn upper_id(&self) -> u64 {
        match self {
            Segment::Memory(seg) => seg.upper_id(),
            Segment::Log(seg) => seg.upper_id(),
            Segment::Disk(seg) => seg.upper_id(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Segment::Memory(seg) => seg.size(),
            Segment::Log(seg) => seg.size(),
            Segment::Disk(seg) => seg.size(),
        }
    }

    /// `Some(empty)` is a tombstone and shadows older segments; `None` means
    /// this segment holds nothing for the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self {
            Segment::Memory(seg) => Ok(seg.get(key)),
            Segment::Log(seg) => Ok(seg.get(key)),
            Segment::Disk(seg) => seg.get(key),
        }
    }

    /// Forward iterator over `[lower, upper]`, both bounds inclusive and
    /// optional.
    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<SegmentIter> {
        match self {
            Segment::Memory(seg) => Ok(SegmentIter::Mem(seg.lookup(lower, upper))),
            Segment::Log(seg) => Ok(SegmentIter::Mem(seg.lookup(lower, upper))),
            Segment::Disk(seg) => Ok(match seg.lookup(lower, upper)? {
                Some(iter) => SegmentIter::Disk(iter),
                None => SegmentIter::Empty,
            }),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Segment::Memory(seg) => seg.close(),
            // Mappings and replayed lists release with the last reference.
            Segment::Log(_) | Segment::Disk(_) => Ok(()),
        }
    }

    /// Base names of the files backing this segment, for the deleter.
    pub fn files(&self) -> Vec<String> {
        match self {
            Segment::Memory(seg) => seg.files(),
            Segment::Log(seg) => seg.files(),
            Segment::Disk(seg) => seg.files(),
        }
    }

    /// Defer file removal until the last reader drops its handle.
    pub fn mark_remove_on_drop(&self) {
        match self {
            Segment::Memory(seg) => seg.mark_remove_on_drop(),
            Segment::Log(seg) => seg.mark_remove_on_drop(),
            Segment::Disk(seg) => seg.mark_remove_on_drop(),
        }
    }

    /// Close and unlink immediately. Used for segments found redundant at
    /// load, before any reader can hold them.
    pub fn remove_files(&self) -> Result<()> {
        match self {
            Segment::Memory(seg) => seg.remove_files(),
            Segment::Log(seg) => seg.remove_files(),
            Segment::Disk(seg) => seg.remove_files(),
        }
    }

    pub fn same_as(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Memory(a), Segment::Memory(b)) => Arc::ptr_eq(a, b),
            (Segment::Log(a), Segment::Log(b)) => Arc::ptr_eq(a, b),
            (Segment::Disk(a), Segment::Disk(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_memory(&self) -> Option<&Arc<MemorySegment>> {
        match self {
            Segment::Memory(seg) => Some(seg),
            _ => None,
        }
    }
}

pub(crate) enum SegmentIter {
    Mem(MemIter),
    Disk(DiskIter),
    Empty,
}

impl Iterator for SegmentIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SegmentIter::Mem(iter) => iter.next(),
            SegmentIter::Disk(iter) => iter.next(),
            SegmentIter::Empty => None,
        }
    }
}
