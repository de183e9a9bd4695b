//! Segment compaction.
//!
//! A merge pass replaces a window of adjacent segments with a single disk
//! segment covering the same ID range. Passes are triggered by a periodic
//! background tick, by foreground backpressure when the segment count runs
//! past twice the configured cap, and by close. At most one pass runs at a
//! time per database.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::db::DbInner;
use crate::disk::write_and_load_segment;
use crate::error::Result;
use crate::multi::MultiSegment;
use crate::segment::Segment;

const MERGE_TICK: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(25);
const INTER_PASS_PAUSE: Duration = Duration::from_millis(100);

/// Repeatedly merges until at most `target` segments remain. Returns
/// immediately when another pass is already running.
pub(crate) fn merge_segments(inner: &DbInner, target: usize) -> Result<()> {
    if inner
        .in_merge
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Ok(());
    }
    let result = merge_loop(inner, target);
    inner.in_merge.store(false, Ordering::Release);
    result
}

fn merge_loop(inner: &DbInner, target: usize) -> Result<()> {
    loop {
        let state = inner.current_state();
        let segments = &state.segments;
        if segments.len() <= target {
            return Ok(());
        }

        let max_merge_size = (segments.len() / 2).max(4);

        // Start at the smallest segment so work concentrates on small recent
        // segments and leaves the large cold tail alone.
        let mut smallest = 0;
        for (index, segment) in segments.iter().enumerate().skip(1) {
            if segment.size() < segments[smallest].size() {
                smallest = index;
            }
        }
        // The window extends rightward, so back off when the smallest
        // segment is the last one.
        if smallest > 0 && smallest == segments.len() - 1 {
            smallest -= 1;
        }
        let index = smallest;

        let window: Vec<Segment> = segments[index..]
            .iter()
            .take(max_merge_size)
            .cloned()
            .collect();

        // Dropping tombstones is only safe when no older segment can hold a
        // value they shadow.
        let merged = merge_window(inner, &window, index == 0)?;

        {
            let _guard = inner.write_lock.lock();
            let state = inner.current_state();
            let segments = &state.segments;

            // Only the merger replaces mid-list segments; writers append.
            for (offset, segment) in window.iter().enumerate() {
                assert!(
                    segment.same_as(&segments[index + offset]),
                    "unexpected segment change during merge"
                );
            }
            for segment in &window {
                segment.mark_remove_on_drop();
            }

            let mut merged_list = Vec::with_capacity(segments.len() - window.len() + 1);
            merged_list.extend_from_slice(&segments[..index]);
            merged_list.push(merged);
            merged_list.extend_from_slice(&segments[index + window.len()..]);
            inner.publish_state_locked(merged_list, state.memory.clone());
        }

        std::thread::sleep(INTER_PASS_PAUSE);
    }
}

/// Writes the merged replacement for `window` and schedules the source files
/// for deletion. The state swap happens at the caller, after the new files
/// are durable.
fn merge_window(inner: &DbInner, window: &[Segment], purge_deleted: bool) -> Result<Segment> {
    let lower_id = window[0].lower_id();
    let upper_id = window[window.len() - 1].upper_id();

    let files: Vec<String> = window.iter().flat_map(|segment| segment.files()).collect();

    let multi = MultiSegment::new(window.to_vec(), inner.cmp.clone());
    let records = multi.lookup(None, None)?;

    let merged = write_and_load_segment(
        &inner.path,
        lower_id,
        upper_id,
        records,
        purge_deleted,
        inner.cmp.clone(),
    )?;
    inner.deleter.schedule_deletion(&files)?;
    Ok(Segment::Disk(merged))
}

pub(crate) struct MergerHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MergerHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MergerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background task bounding the segment count. Holds only a weak reference
/// so an abandoned database can still be dropped.
pub(crate) fn spawn_merger(inner: &Arc<DbInner>) -> MergerHandle {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let weak: Weak<DbInner> = Arc::downgrade(inner);
    let stop_thread = Arc::clone(&stop);

    let join = std::thread::Builder::new()
        .name("stratadb-merger".to_string())
        .spawn(move || loop {
            let deadline = Instant::now() + MERGE_TICK;
            loop {
                if stop_thread.load(Ordering::Relaxed) {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep(deadline.saturating_duration_since(now).min(STOP_POLL));
            }

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.closing.load(Ordering::Relaxed) || inner.has_async_error() {
                return;
            }
            if let Err(err) = merge_segments(&inner, inner.options.max_segments) {
                inner.latch_async_error(format!("unable to merge segments: {err}"));
                return;
            }
        })
        .expect("spawn merger thread");

    MergerHandle {
        stop,
        join: Some(join),
    }
}
