//! Read-only segment recovered from a log file left behind by a previous
//! run. Replayed into a skip list at open; merged away like any other
//! segment.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::db::options::{KeyCompare, Options};
use crate::error::Result;
use crate::log::read_log_file;
use crate::memory::MemIter;
use crate::segment::segment_id;
use crate::skiplist::SkipList;

pub(crate) struct LogSegment {
    list: Arc<SkipList>,
    id: u64,
    path: PathBuf,
    file_size: u64,
    cmp: KeyCompare,
    remove_on_drop: AtomicBool,
}

impl LogSegment {
    pub fn open(path: PathBuf, options: &Options) -> Result<LogSegment> {
        let list = read_log_file(&path, options)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = segment_id(&name);
        let file_size = std::fs::metadata(&path)?.len();
        Ok(LogSegment {
            list: Arc::new(list),
            id,
            path,
            file_size,
            cmp: options.key_compare(),
            remove_on_drop: AtomicBool::new(false),
        })
    }

    pub fn lower_id(&self) -> u64 {
        self.id
    }

    pub fn upper_id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.list.get(key)
    }

    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> MemIter {
        MemIter::new(&self.list, lower, upper, self.cmp.clone())
    }

    pub fn files(&self) -> Vec<String> {
        vec![self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()]
    }

    pub fn mark_remove_on_drop(&self) {
        self.remove_on_drop.store(true, Ordering::Relaxed);
    }

    pub fn remove_files(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LogSegment {
    fn drop(&mut self) {
        if self.remove_on_drop.load(Ordering::Relaxed) {
            let _ = self.remove_files();
        }
    }
}
