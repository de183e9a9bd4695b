use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Key comparator captured once at open and threaded into every segment.
pub type KeyCompare = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

pub(crate) fn default_key_compare() -> KeyCompare {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Handling of a batch that was cut short by a crash, applied while
/// replaying log files during open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchReadMode {
    /// Discard the partial batch and keep everything before it.
    #[default]
    DiscardPartial,
    /// Apply the complete records of the partial batch, then stop.
    ApplyPartial,
    /// Fail the open.
    ReturnOpenError,
}

pub(crate) const MIN_MEMORY_BYTES: u64 = 1024 * 1024;
pub(crate) const MIN_SEGMENTS: usize = 8;

#[derive(Clone)]
pub struct Options {
    /// Create the database directory on open if it does not exist.
    pub create_if_needed: bool,
    /// Disable the background merger; segments are merged only at close.
    pub disable_auto_merge: bool,
    /// Soft cap on the segment count, which bounds the number of open files.
    /// When the count exceeds twice this value writers are paused while a
    /// foreground merge runs.
    pub max_segments: usize,
    /// Rollover threshold for the writable memory segment. Peak memory use is
    /// roughly `max_segments * max_memory_bytes` but can exceed it under a
    /// fast producer.
    pub max_memory_bytes: u64,
    /// Skip the flush after each single write. Ignored when
    /// `enable_sync_write` is set.
    pub disable_write_flush: bool,
    /// Force every log write to durable storage before returning.
    pub enable_sync_write: bool,
    /// Partial-batch policy for log replay during open.
    pub batch_read_mode: BatchReadMode,
    /// Key ordering; `None` selects unsigned-byte lexicographic order. The
    /// chosen order is a property of the database and must be identical
    /// across sessions.
    pub user_key_compare: Option<KeyCompare>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_needed: false,
            disable_auto_merge: false,
            max_segments: MIN_SEGMENTS,
            max_memory_bytes: MIN_MEMORY_BYTES,
            disable_write_flush: false,
            enable_sync_write: false,
            batch_read_mode: BatchReadMode::default(),
            user_key_compare: None,
        }
    }
}

impl Options {
    pub(crate) fn key_compare(&self) -> KeyCompare {
        self.user_key_compare
            .clone()
            .unwrap_or_else(default_key_compare)
    }

    /// Floors applied at open so a misconfigured database still behaves.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_memory_bytes = self.max_memory_bytes.max(MIN_MEMORY_BYTES);
        self.max_segments = self.max_segments.max(MIN_SEGMENTS);
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("create_if_needed", &self.create_if_needed)
            .field("disable_auto_merge", &self.disable_auto_merge)
            .field("max_segments", &self.max_segments)
            .field("max_memory_bytes", &self.max_memory_bytes)
            .field("disable_write_flush", &self.disable_write_flush)
            .field("enable_sync_write", &self.enable_sync_write)
            .field("batch_read_mode", &self.batch_read_mode)
            .field("user_key_compare", &self.user_key_compare.is_some())
            .finish()
    }
}
