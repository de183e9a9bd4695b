//! Ordered in-memory index for the writable segment.
//!
//! Single writer, many lock-free readers. Writes are serialized by the
//! internal writer mutex (the database write lock already guarantees this on
//! the hot path); readers traverse the level links with acquire loads and
//! never block.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::db::options::KeyCompare;

const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

struct Node {
    key: Bytes,
    /// Null only on the head sentinel. Replaced wholesale on update; the
    /// superseded box is retired, not freed, so a concurrent reader that
    /// already loaded the old pointer stays valid.
    value: AtomicPtr<Bytes>,
    next: Box<[AtomicPtr<Node>]>,
}

impl Node {
    fn alloc(key: Bytes, value: Option<Bytes>, height: usize) -> *mut Node {
        let next = (0..height)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let value = match value {
            Some(v) => AtomicPtr::new(Box::into_raw(Box::new(v))),
            None => AtomicPtr::new(ptr::null_mut()),
        };
        Box::into_raw(Box::new(Node { key, value, next }))
    }

    fn next(&self, level: usize) -> *mut Node {
        self.next[level].load(AtomicOrdering::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        self.next[level].store(node, AtomicOrdering::Release);
    }

    fn value(&self) -> Bytes {
        let ptr = self.value.load(AtomicOrdering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { (*ptr).clone() }
    }
}

struct WriterState {
    rng: SmallRng,
    /// Value boxes superseded by updates, freed when the list drops.
    retired: Vec<*mut Bytes>,
}

pub(crate) struct SkipList {
    cmp: KeyCompare,
    head: *mut Node,
    max_height: AtomicUsize,
    writer: Mutex<WriterState>,
}

// Nodes are reachable from multiple threads but only ever mutated through
// atomics; the raw pointers are owned by the list and freed at drop.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new(cmp: KeyCompare) -> Self {
        Self {
            cmp,
            head: Node::alloc(Bytes::new(), None, MAX_HEIGHT),
            max_height: AtomicUsize::new(1),
            writer: Mutex::new(WriterState {
                rng: SmallRng::from_entropy(),
                retired: Vec::new(),
            }),
        }
    }

    /// Insert or replace. Returns the previous `(key, value)` pair when the
    /// key was already present so the caller can maintain byte accounting.
    ///
    /// Concurrent `put`s are not supported; the internal mutex makes a
    /// violation safe but callers are expected to serialize externally.
    pub fn put(&self, key: Bytes, value: Bytes) -> Option<(Bytes, Bytes)> {
        let mut writer = self.writer.lock();

        let mut prev = [ptr::null_mut::<Node>(); MAX_HEIGHT];
        let found = self.find_greater_or_equal(&key, Some(&mut prev));

        if !found.is_null() {
            let node = unsafe { &*found };
            if (self.cmp)(&node.key, &key) == Ordering::Equal {
                let fresh = Box::into_raw(Box::new(value));
                let old = node.value.swap(fresh, AtomicOrdering::AcqRel);
                let old_value = unsafe { (*old).clone() };
                writer.retired.push(old);
                return Some((node.key.clone(), old_value));
            }
        }

        let height = Self::random_height(&mut writer.rng);
        let current = self.max_height();
        if height > current {
            for slot in prev.iter_mut().take(height).skip(current) {
                *slot = self.head;
            }
            // Raise the height before linking. A reader that observes the new
            // height ahead of the new links sees a null pointer at the extra
            // levels, which sorts after every key, and drops down a level.
            self.max_height.store(height, AtomicOrdering::Release);
        }

        let node = Node::alloc(key, Some(value), height);
        for level in 0..height {
            unsafe {
                // The release store into prev publishes these links.
                (*node).next[level]
                    .store((*prev[level]).next(level), AtomicOrdering::Relaxed);
                (*prev[level]).set_next(level, node);
            }
        }
        None
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let found = self.find_greater_or_equal(key, None);
        if found.is_null() {
            return None;
        }
        let node = unsafe { &*found };
        if (self.cmp)(&node.key, key) == Ordering::Equal {
            Some(node.value())
        } else {
            None
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(self: &Arc<Self>) -> SkipIter {
        SkipIter {
            list: Arc::clone(self),
            node: ptr::null(),
        }
    }

    fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Acquire)
    }

    fn random_height(rng: &mut SmallRng) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }

    /// First node with key >= `key`, or null when every key is smaller.
    /// When `prev` is supplied it is filled with the rightmost node before
    /// the result at every level, for use by the insertion path.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(slots) = prev.as_deref_mut() {
                    slots[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        // A null link sorts after all keys.
        !node.is_null() && (self.cmp)(unsafe { &(*node).key }, key) == Ordering::Less
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        let mut node = self.head;
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            let value = boxed.value.load(AtomicOrdering::Relaxed);
            if !value.is_null() {
                drop(unsafe { Box::from_raw(value) });
            }
            node = boxed.next[0].load(AtomicOrdering::Relaxed);
        }
        for retired in self.writer.get_mut().retired.drain(..) {
            drop(unsafe { Box::from_raw(retired) });
        }
    }
}

/// Forward cursor over the list. Holds the list alive, so the node pointer
/// can never dangle.
pub(crate) struct SkipIter {
    list: Arc<SkipList>,
    node: *const Node,
}

unsafe impl Send for SkipIter {}

impl SkipIter {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    /// Position at the first entry with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.node = self.list.find_greater_or_equal(key, None);
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn key(&self) -> &Bytes {
        debug_assert!(self.valid());
        unsafe { &(*self.node).key }
    }

    pub fn value(&self) -> Bytes {
        debug_assert!(self.valid());
        unsafe { (*self.node).value() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::options::default_key_compare;

    fn list() -> Arc<SkipList> {
        Arc::new(SkipList::new(default_key_compare()))
    }

    #[test]
    fn put_get_replace() {
        let list = list();
        assert!(list.put(Bytes::from("a"), Bytes::from("1")).is_none());
        assert!(list.put(Bytes::from("c"), Bytes::from("3")).is_none());
        assert_eq!(list.get(b"a"), Some(Bytes::from("1")));
        assert_eq!(list.get(b"b"), None);
        assert!(list.contains(b"c"));

        let prev = list.put(Bytes::from("a"), Bytes::from("one"));
        assert_eq!(prev, Some((Bytes::from("a"), Bytes::from("1"))));
        assert_eq!(list.get(b"a"), Some(Bytes::from("one")));
    }

    #[test]
    fn iterates_in_order() {
        let list = list();
        for key in ["delta", "alpha", "echo", "bravo", "charlie"] {
            list.put(Bytes::from(key), Bytes::from("x"));
        }
        let mut iter = list.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key().clone());
            iter.next();
        }
        assert_eq!(seen, ["alpha", "bravo", "charlie", "delta", "echo"]);
    }

    #[test]
    fn seek_positions_at_first_ge() {
        let list = list();
        for key in ["b", "d", "f"] {
            list.put(Bytes::from(key), Bytes::from("x"));
        }
        let mut iter = list.iter();
        iter.seek(b"c");
        assert!(iter.valid());
        assert_eq!(iter.key().as_ref(), b"d");
        iter.seek(b"g");
        assert!(!iter.valid());
    }

    #[test]
    fn readers_race_a_single_writer() {
        let list = list();
        let reader = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    if let Some(value) = list.get(b"key-0500") {
                        assert_eq!(value.as_ref(), b"value-500");
                    }
                    let mut iter = list.iter();
                    iter.seek_to_first();
                    let mut prev: Option<Bytes> = None;
                    while iter.valid() {
                        let key = iter.key().clone();
                        if let Some(p) = &prev {
                            assert!(p.as_ref() < key.as_ref());
                        }
                        prev = Some(key);
                        iter.next();
                    }
                }
            })
        };

        for i in 0..1_000 {
            list.put(
                Bytes::from(format!("key-{i:04}")),
                Bytes::from(format!("value-{i}")),
            );
        }
        reader.join().unwrap();

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 1_000);
    }
}
