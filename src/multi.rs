//! Virtual segment overlaying an ordered list of segments, oldest first.
//!
//! The same key may appear in several segments with different values; the
//! newest segment always wins. Tombstones (empty values) are surfaced here
//! and filtered at the database layer, because a merge must still carry them
//! forward.

use bytes::Bytes;

use crate::db::options::KeyCompare;
use crate::error::Result;
use crate::segment::{Segment, SegmentIter};

pub(crate) struct MultiSegment {
    segments: Vec<Segment>,
    cmp: KeyCompare,
}

impl MultiSegment {
    pub fn new(segments: Vec<Segment>, cmp: KeyCompare) -> Self {
        Self { segments, cmp }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// First hit scanning newest to oldest. A tombstone in a newer segment
    /// shadows older puts and is returned as `Some(empty)`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        for segment in self.segments.iter().rev() {
            if let Some(value) = segment.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn lookup(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<MultiIter> {
        let mut children = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            children.push(segment.lookup(lower, upper)?);
        }
        Ok(MultiIter::new(children, self.cmp.clone()))
    }
}

/// Merging iterator: each distinct key exactly once, value taken from the
/// newest segment holding it.
pub(crate) struct MultiIter {
    /// Oldest first, parallel to `slots`.
    children: Vec<SegmentIter>,
    /// One prefetched record per child.
    slots: Vec<Option<(Bytes, Bytes)>>,
    cmp: KeyCompare,
}

impl MultiIter {
    fn new(children: Vec<SegmentIter>, cmp: KeyCompare) -> Self {
        let slots = (0..children.len()).map(|_| None).collect();
        Self {
            children,
            slots,
            cmp,
        }
    }

    fn fill_slot(&mut self, index: usize) -> Result<()> {
        if self.slots[index].is_none() {
            if let Some(record) = self.children[index].next() {
                self.slots[index] = Some(record?);
            }
        }
        Ok(())
    }
}

impl Iterator for MultiIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        for index in 0..self.children.len() {
            if let Err(err) = self.fill_slot(index) {
                return Some(Err(err));
            }
        }

        // Smallest key wins; scanning newest-first resolves ties in favor of
        // the newest segment.
        let mut chosen: Option<usize> = None;
        for index in (0..self.slots.len()).rev() {
            let Some((key, _)) = &self.slots[index] else {
                continue;
            };
            match chosen {
                None => chosen = Some(index),
                Some(current) => {
                    let (current_key, _) = self.slots[current].as_ref().unwrap();
                    if (self.cmp)(key, current_key) == std::cmp::Ordering::Less {
                        chosen = Some(index);
                    }
                }
            }
        }
        let chosen = chosen?;
        let (key, value) = self.slots[chosen].take().unwrap();

        // Advance every other child past the yielded key so shadowed records
        // never surface.
        for index in 0..self.children.len() {
            if index == chosen {
                continue;
            }
            loop {
                let shadowed = match &self.slots[index] {
                    Some((other, _)) => (self.cmp)(other, &key) != std::cmp::Ordering::Greater,
                    None => false,
                };
                if !shadowed {
                    break;
                }
                self.slots[index] = None;
                if let Err(err) = self.fill_slot(index) {
                    return Some(Err(err));
                }
                if self.slots[index].is_none() {
                    break;
                }
            }
        }

        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::options::default_key_compare;
    use crate::memory::MemorySegment;

    fn segment(pairs: &[(&str, &str)]) -> Segment {
        let seg = MemorySegment::memory_only();
        for (k, v) in pairs {
            seg.put(Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes()))
                .unwrap();
        }
        Segment::Memory(Arc::new(seg))
    }

    fn collect(multi: &MultiSegment) -> Vec<(Bytes, Bytes)> {
        multi
            .lookup(None, None)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn newest_segment_wins() -> anyhow::Result<()> {
        let old = segment(&[("a", "old"), ("b", "old"), ("c", "old")]);
        let new = segment(&[("b", "new")]);
        let multi = MultiSegment::new(vec![old, new], default_key_compare());

        assert_eq!(multi.get(b"b")?, Some(Bytes::from("new")));
        assert_eq!(multi.get(b"a")?, Some(Bytes::from("old")));
        assert_eq!(multi.get(b"x")?, None);

        let all = collect(&multi);
        assert_eq!(
            all,
            vec![
                (Bytes::from("a"), Bytes::from("old")),
                (Bytes::from("b"), Bytes::from("new")),
                (Bytes::from("c"), Bytes::from("old")),
            ]
        );
        Ok(())
    }

    #[test]
    fn tombstones_shadow_and_surface() -> anyhow::Result<()> {
        let old = segment(&[("a", "1"), ("b", "2")]);
        let new = segment(&[("a", "")]);
        let multi = MultiSegment::new(vec![old, new], default_key_compare());

        assert_eq!(multi.get(b"a")?, Some(Bytes::new()));

        let all = collect(&multi);
        assert_eq!(
            all,
            vec![
                (Bytes::from("a"), Bytes::new()),
                (Bytes::from("b"), Bytes::from("2")),
            ]
        );
        Ok(())
    }

    #[test]
    fn three_layers_yield_each_key_once() -> anyhow::Result<()> {
        let first = segment(&[("k1", "a1"), ("k2", "a2"), ("k3", "a3")]);
        let second = segment(&[("k2", "b2")]);
        let third = segment(&[("k2", "c2"), ("k4", "c4")]);
        let multi =
            MultiSegment::new(vec![first, second, third], default_key_compare());

        let all = collect(&multi);
        assert_eq!(
            all,
            vec![
                (Bytes::from("k1"), Bytes::from("a1")),
                (Bytes::from("k2"), Bytes::from("c2")),
                (Bytes::from("k3"), Bytes::from("a3")),
                (Bytes::from("k4"), Bytes::from("c4")),
            ]
        );
        Ok(())
    }
}
