//! Streaming decoder over a disk segment's key blocks.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

use super::{
    decode_key, decode_key_len, read_u16, read_u32, read_u64, DiskSegment, END_OF_BLOCK,
    KEY_BLOCK_SIZE, RECORD_TRAILER,
};

/// Range iterator over one disk segment. Bounds are inclusive; records below
/// `lower` are skipped and the iterator finishes past `upper`.
pub(crate) struct DiskIter {
    segment: Arc<DiskSegment>,
    lower: Option<Bytes>,
    upper: Option<Bytes>,
    buffer: Vec<u8>,
    block: u64,
    offset: usize,
    prev_key: Vec<u8>,
    finished: bool,
}

impl DiskIter {
    pub fn new(
        segment: Arc<DiskSegment>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        block: u64,
    ) -> Result<Self> {
        let mut buffer = vec![0u8; KEY_BLOCK_SIZE];
        segment.read_block(block, &mut buffer)?;
        Ok(Self {
            segment,
            lower: lower.map(Bytes::copy_from_slice),
            upper: upper.map(Bytes::copy_from_slice),
            buffer,
            block,
            offset: 0,
            prev_key: Vec::new(),
            finished: false,
        })
    }

    fn next_record(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let word = read_u16(
                self.buffer
                    .get(self.offset..self.offset + 2)
                    .ok_or(Error::Corrupted("key block overrun"))?,
            );
            if word == END_OF_BLOCK {
                self.block += 1;
                if self.block == self.segment.key_blocks() {
                    self.finished = true;
                    return Ok(None);
                }
                let block = self.block;
                self.segment.read_block(block, &mut self.buffer)?;
                self.offset = 0;
                self.prev_key.clear();
                continue;
            }

            let (prefix_len, suffix_len) = decode_key_len(word)?;
            let key_end = self.offset + 2 + suffix_len;
            let suffix = self
                .buffer
                .get(self.offset + 2..key_end)
                .ok_or(Error::Corrupted("key block overrun"))?;
            let key = decode_key(suffix, &self.prev_key, prefix_len)?;

            let trailer = self
                .buffer
                .get(key_end..key_end + RECORD_TRAILER)
                .ok_or(Error::Corrupted("key block overrun"))?;
            let data_offset = read_u64(&trailer[..8]);
            let data_len = read_u32(&trailer[8..]);
            self.offset = key_end + RECORD_TRAILER;
            self.prev_key = key.clone();

            if let Some(lower) = &self.lower {
                if self.segment.compare(&key, lower) == std::cmp::Ordering::Less {
                    continue;
                }
            }
            if let Some(upper) = &self.upper {
                if self.segment.compare(&key, upper) == std::cmp::Ordering::Greater {
                    self.finished = true;
                    return Ok(None);
                }
            }

            let value = self.segment.read_data(data_offset, data_len)?;
            return Ok(Some((Bytes::from(key), value)));
        }
    }
}

impl Iterator for DiskIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
