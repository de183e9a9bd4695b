//! Database facade.
//!
//! A database is a directory holding log files, disk-segment pairs, the
//! advisory lockfile, and the deletion journal. One process may hold it at a
//! time; within that process the handle is cheap to clone and safe to share
//! across threads.
//!
//! The readable state is a `(segments, memory, multi)` triple published
//! wholesale behind a lock-free-for-readers `RwLock<Arc<_>>`: readers clone
//! the `Arc` and keep a consistent view for as long as they hold it, while
//! mutations build a fresh triple under the write lock and swap it in.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::deleter::Deleter;
use crate::disk::{write_and_load_segment, DiskSegment};
use crate::error::{Error, Result};
use crate::logseg::LogSegment;
use crate::memory::MemorySegment;
use crate::merger::{merge_segments, spawn_merger, MergerHandle};
use crate::multi::MultiSegment;
use crate::segment::{data_file_name, keys_file_name, segment_ids, Segment};

pub(crate) mod iterator;
pub(crate) mod options;
pub(crate) mod ops;
pub(crate) mod snapshot;

pub use iterator::DbIterator;
pub use options::{BatchReadMode, KeyCompare, Options};
pub use snapshot::Snapshot;

use snapshot::SnapshotInner;

const LOCK_FILE: &str = "lockfile";
const DELETED_FILE: &str = "deleted";

/// Serializes open, close, and destroy so lockfile churn and directory
/// mutations cannot race each other within the process.
static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of read-only segments currently on the stack.
    pub num_segments: usize,
}

/// Atomic batch of mutations applied by [`Db::write`].
#[derive(Default)]
pub struct WriteBatch {
    pub(crate) entries: Vec<(Bytes, Bytes)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn remove(&mut self, key: impl Into<Bytes>) {
        self.entries.push((key.into(), Bytes::new()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) struct DbState {
    pub segments: Vec<Segment>,
    pub memory: Option<Arc<MemorySegment>>,
    pub multi: Option<Arc<MultiSegment>>,
}

/// Database handle. Obtained from [`Db::open`]; clones share one database.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

pub(crate) struct DbInner {
    pub path: PathBuf,
    pub options: Options,
    pub cmp: KeyCompare,
    pub deleter: Deleter,
    lockfile: Mutex<Option<File>>,
    next_seg_id: AtomicU64,
    state: RwLock<Arc<DbState>>,
    /// Serializes mutations and state publication. Reads never take it.
    pub write_lock: Mutex<()>,
    pub open: AtomicBool,
    pub closing: AtomicBool,
    pub in_merge: AtomicBool,
    async_error: RwLock<Option<String>>,
    snapshots: Mutex<Vec<Weak<SnapshotInner>>>,
    merger: Mutex<Option<MergerHandle>>,
}

impl Db {
    /// Opens a database directory, recovering any log files left behind by a
    /// previous run. With `create_if_needed` the directory is created when
    /// absent.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        let _guard = GLOBAL_LOCK.lock();
        let path = path.as_ref();

        match Self::open_existing(path, options.clone()) {
            Err(Error::NoDatabaseFound) if options.create_if_needed => {
                std::fs::create_dir_all(path)?;
                Self::open_existing(path, options)
            }
            other => other,
        }
    }

    fn open_existing(path: &Path, options: Options) -> Result<Db> {
        is_valid_database(path)?;
        let options = options.normalized();
        let cmp = options.key_compare();

        let lockfile = acquire_lock(path)?;

        let deleter = Deleter::new(path);
        deleter.delete_scheduled()?;

        let segments = load_segments(path, &options)?;
        let max_seg_id = segments
            .iter()
            .map(|segment| segment.upper_id())
            .max()
            .unwrap_or(0);

        let inner = Arc::new(DbInner {
            path: path.to_path_buf(),
            options: options.clone(),
            cmp,
            deleter,
            lockfile: Mutex::new(Some(lockfile)),
            next_seg_id: AtomicU64::new(max_seg_id),
            state: RwLock::new(Arc::new(DbState {
                segments: Vec::new(),
                memory: None,
                multi: None,
            })),
            write_lock: Mutex::new(()),
            open: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            in_merge: AtomicBool::new(false),
            async_error: RwLock::new(None),
            snapshots: Mutex::new(Vec::new()),
            merger: Mutex::new(None),
        });

        let memory = Arc::new(MemorySegment::new(
            Some(inner.path.clone()),
            inner.next_segment_id(),
            options.clone(),
        ));
        inner.publish_state_locked(segments, Some(memory));

        if !options.disable_auto_merge {
            *inner.merger.lock() = Some(spawn_merger(&inner));
        }

        Ok(Db { inner })
    }

    /// Deletes the database and every file in it. Fails with
    /// [`Error::DatabaseInUse`] when another process holds it open.
    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        let _guard = GLOBAL_LOCK.lock();
        let path = path.as_ref();

        is_valid_database(path)?;
        let lockfile = acquire_lock(path)?;
        std::fs::remove_dir_all(path)?;
        drop(lockfile);
        Ok(())
    }

    /// Closes the database, persisting memory segments and merging down to
    /// the configured segment cap.
    pub fn close(&self) -> Result<()> {
        self.close_with_merge(self.inner.options.max_segments)
    }

    /// Closes with explicit control over the terminal merge: the remaining
    /// segments are merged until at most `segment_count` remain, or not at
    /// all when it is zero.
    pub fn close_with_merge(&self, segment_count: usize) -> Result<()> {
        let _guard = GLOBAL_LOCK.lock();
        let inner = &self.inner;

        if !inner.open.load(Ordering::Acquire) {
            return Err(Error::DatabaseClosed);
        }

        let mut first_err: Option<Error> = inner
            .async_error
            .read()
            .clone()
            .map(Error::Background);

        if first_err.is_none() {
            inner.closing.store(true, Ordering::Release);
            if let Some(mut handle) = inner.merger.lock().take() {
                handle.stop();
            }

            // Fold the head memory segment into the read-only list; writes
            // are rejected from here on.
            {
                let _w = inner.write_lock.lock();
                let state = inner.current_state();
                let mut segments = state.segments.clone();
                if let Some(memory) = &state.memory {
                    segments.push(Segment::Memory(Arc::clone(memory)));
                }
                inner.store_state(Arc::new(DbState {
                    segments,
                    memory: None,
                    multi: None,
                }));
            }

            if segment_count > 0 {
                if let Err(err) = merge_segments(inner, segment_count) {
                    first_err = Some(err);
                }
            }

            if first_err.is_none() {
                {
                    let _w = inner.write_lock.lock();
                    for weak in inner.snapshots.lock().drain(..) {
                        if let Some(snapshot) = weak.upgrade() {
                            snapshot.close();
                        }
                    }
                }

                let state = inner.current_state();
                let memories: Vec<Arc<MemorySegment>> = state
                    .segments
                    .iter()
                    .filter_map(|segment| segment.as_memory().cloned())
                    .collect();
                let flushed: std::result::Result<Vec<()>, Error> = memories
                    .par_iter()
                    .map(|segment| write_segment_to_disk(inner, segment))
                    .collect();
                if let Err(err) = flushed {
                    first_err = Some(err);
                }

                for segment in &state.segments {
                    if let Err(err) = segment.close() {
                        first_err.get_or_insert(err);
                    }
                }

                if let Err(err) = inner.deleter.delete_scheduled() {
                    first_err.get_or_insert(err);
                }
            }
        }

        inner.store_state(Arc::new(DbState {
            segments: Vec::new(),
            memory: None,
            multi: None,
        }));
        // Dropping the handle releases the advisory lock.
        *inner.lockfile.lock() = None;
        inner.open.store(false, Ordering::Release);

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl DbInner {
    pub(crate) fn current_state(&self) -> Arc<DbState> {
        self.state.read().clone()
    }

    pub(crate) fn store_state(&self, state: Arc<DbState>) {
        *self.state.write() = state;
    }

    /// Rebuilds the multi overlay and publishes a new triple. Callers must
    /// hold `write_lock` (or be the only reference, during open).
    pub(crate) fn publish_state_locked(
        &self,
        segments: Vec<Segment>,
        memory: Option<Arc<MemorySegment>>,
    ) {
        let mut overlay = segments.clone();
        if let Some(memory) = &memory {
            overlay.push(Segment::Memory(Arc::clone(memory)));
        }
        let multi = Arc::new(MultiSegment::new(overlay, self.cmp.clone()));
        self.store_state(Arc::new(DbState {
            segments,
            memory,
            multi: Some(multi),
        }));
    }

    pub(crate) fn next_segment_id(&self) -> u64 {
        self.next_seg_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Gate for every public operation: the database must be open and not
    /// poisoned by a background failure.
    pub(crate) fn check_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::DatabaseClosed);
        }
        if let Some(message) = self.async_error.read().clone() {
            return Err(Error::Background(message));
        }
        Ok(())
    }

    pub(crate) fn has_async_error(&self) -> bool {
        self.async_error.read().is_some()
    }

    /// Latches the first background failure; later ones are dropped.
    pub(crate) fn latch_async_error(&self, message: String) {
        let mut slot = self.async_error.write();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub(crate) fn register_snapshot(&self, snapshot: &Arc<SnapshotInner>) {
        let mut snapshots = self.snapshots.lock();
        snapshots.retain(|weak| weak.strong_count() > 0);
        snapshots.push(Arc::downgrade(snapshot));
    }
}

/// Checks that `path` is a database directory or an empty directory. Any
/// unrecognized file means the directory belongs to something else and the
/// open is refused.
pub fn is_valid_database(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Err(Error::NoDatabaseFound),
    };
    if !meta.is_dir() {
        return Err(Error::NotADirectory);
    }

    for entry in std::fs::read_dir(path)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name == LOCK_FILE || name == DELETED_FILE {
            continue;
        }
        if name.starts_with("log.") || name.starts_with("keys.") || name.starts_with("data.") {
            continue;
        }
        return Err(Error::NotValidDatabase);
    }
    Ok(())
}

fn acquire_lock(dir: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.join(LOCK_FILE))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(std::fs::TryLockError::WouldBlock) => Err(Error::DatabaseInUse),
        Err(std::fs::TryLockError::Error(e)) => Err(Error::Io(e)),
    }
}

/// Loads every segment present in the directory: log files become replayed
/// log segments, `keys.`/`data.` pairs become disk segments. Leftover `.tmp`
/// files mark an interrupted writer; they and their final-name siblings are
/// removed first. Segments fully contained in another segment's ID range are
/// stale merge leftovers and are dropped.
fn load_segments(dir: &Path, options: &Options) -> Result<Vec<Segment>> {
    let names = list_file_names(dir)?;
    for name in names.iter().filter(|name| name.ends_with(".tmp")) {
        let base = name.trim_end_matches(".tmp");
        let suffix = base
            .strip_prefix("keys.")
            .or_else(|| base.strip_prefix("data."))
            .unwrap_or(base);
        for casualty in [
            format!("keys.{suffix}"),
            format!("data.{suffix}"),
            format!("keys.{suffix}.tmp"),
            format!("data.{suffix}.tmp"),
        ] {
            match std::fs::remove_file(dir.join(&casualty)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let cmp = options.key_compare();
    let mut segments: Vec<Segment> = Vec::new();
    for name in list_file_names(dir)? {
        if name.starts_with("log.") {
            let segment = LogSegment::open(dir.join(&name), options)?;
            segments.push(Segment::Log(Arc::new(segment)));
        } else if name.starts_with("keys.") {
            let (lower, upper) = segment_ids(&name);
            let segment = DiskSegment::open(
                dir.join(keys_file_name(lower, upper)),
                dir.join(data_file_name(lower, upper)),
                None,
                cmp.clone(),
            )?;
            segments.push(Segment::Disk(segment));
        }
    }

    // Oldest first; on an upper-ID tie the wider (newer merge product)
    // segment sorts first so the contained leftover is found and dropped.
    segments.sort_by(|a, b| {
        a.upper_id()
            .cmp(&b.upper_id())
            .then_with(|| b.lower_id().cmp(&a.lower_id()))
    });

    let mut index = 0;
    while index < segments.len() {
        let (lower, upper) = (segments[index].lower_id(), segments[index].upper_id());
        let contained = segments
            .iter()
            .skip(index + 1)
            .any(|other| lower >= other.lower_id() && upper <= other.upper_id());
        if contained {
            let stale = segments.remove(index);
            let _ = stale.remove_files();
        } else {
            index += 1;
        }
    }

    Ok(segments)
}

fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Flushes a frozen memory segment to a disk segment pair and removes its
/// log. An empty segment leaves nothing behind.
fn write_segment_to_disk(inner: &DbInner, segment: &Arc<MemorySegment>) -> Result<()> {
    if segment.is_empty() {
        segment.remove_files()?;
        return Ok(());
    }

    let records = segment.lookup(None, None);
    write_and_load_segment(
        &inner.path,
        segment.lower_id(),
        segment.upper_id(),
        records,
        false,
        inner.cmp.clone(),
    )?;
    segment.remove_files()?;
    Ok(())
}
