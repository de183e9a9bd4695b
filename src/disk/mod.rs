//! Immutable on-disk segments.
//!
//! A segment is a pair of memory-mapped files sharing the suffix
//! `<lower>.<upper>`:
//!
//! - `keys.<l>.<u>` — sorted keys in 4096-byte blocks, prefix-compressed.
//! - `data.<l>.<u>` — raw concatenated values, addressable only through the
//!   key file.
//!
//! Key block format (little-endian):
//!
//! ```text
//! record       : keyLen u16, key bytes, dataOffset i64, dataLen u32
//! end of block : u16 = 0x8000, then zero padding to the block boundary
//! ```
//!
//! When the high bit of `keyLen` is set the key is compressed against the
//! previous key in the same block: bits 8..=14 give the shared-prefix length
//! and bits 0..=7 the stored suffix length. A block always starts with an
//! uncompressed key so blocks can be decoded independently. A `dataLen` of
//! zero marks a removed key; no bytes exist for it in the data file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;

use crate::db::options::KeyCompare;
use crate::error::{Error, Result};
use crate::segment::segment_ids;

mod iter;
mod writer;

pub(crate) use iter::DiskIter;
pub(crate) use writer::write_and_load_segment;

pub(crate) const KEY_BLOCK_SIZE: usize = 4096;
pub(crate) const MAX_KEY_SIZE: usize = 1024;
pub(crate) const END_OF_BLOCK: u16 = 0x8000;
pub(crate) const COMPRESSED_BIT: u16 = 0x8000;
pub(crate) const MAX_PREFIX_LEN: usize = 0x7F;
pub(crate) const MAX_SUFFIX_LEN: usize = 0xFF;
pub(crate) const KEY_INDEX_INTERVAL: usize = 16;
/// Bytes after the key in every record: data offset (8) + data length (4).
pub(crate) const RECORD_TRAILER: usize = 8 + 4;

/// Read-only mapping that treats a zero-length file as an empty view, since
/// a merge can legitimately produce an empty data (or even keys) file.
pub(crate) struct MappedFile {
    path: PathBuf,
    map: Option<Mmap>,
    len: u64,
}

impl MappedFile {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { path, map, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.as_slice()
            .get(offset..offset + len)
            .ok_or(Error::Corrupted("segment read out of bounds"))
    }
}

pub(crate) struct DiskSegment {
    key_file: MappedFile,
    data_file: MappedFile,
    key_blocks: u64,
    lower_id: u64,
    upper_id: u64,
    /// First key of every `KEY_INDEX_INTERVAL`-th block.
    key_index: Vec<Bytes>,
    file_size: u64,
    cmp: KeyCompare,
    remove_on_drop: AtomicBool,
}

impl DiskSegment {
    /// Maps an existing segment pair. `key_index` is reused when the writer
    /// just produced it, otherwise it is rebuilt by scanning the key file.
    pub fn open(
        key_path: PathBuf,
        data_path: PathBuf,
        key_index: Option<Vec<Bytes>>,
        cmp: KeyCompare,
    ) -> Result<Arc<DiskSegment>> {
        let name = key_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (lower_id, upper_id) = segment_ids(&name);

        let key_file = MappedFile::open(key_path)?;
        let data_file = MappedFile::open(data_path)?;
        let key_blocks = key_file.len().div_ceil(KEY_BLOCK_SIZE as u64);
        let file_size = key_file.len() + data_file.len();

        let key_index = match key_index {
            Some(index) => index,
            None => load_key_index(&key_file, key_blocks)?,
        };

        Ok(Arc::new(DiskSegment {
            key_file,
            data_file,
            key_blocks,
            lower_id,
            upper_id,
            key_index,
            file_size,
            cmp,
            remove_on_drop: AtomicBool::new(false),
        }))
    }

    pub fn lower_id(&self) -> u64 {
        self.lower_id
    }

    pub fn upper_id(&self) -> u64 {
        self.upper_id
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn files(&self) -> Vec<String> {
        vec![base_name(self.key_file.path()), base_name(self.data_file.path())]
    }

    pub fn mark_remove_on_drop(&self) {
        self.remove_on_drop.store(true, Ordering::Relaxed);
    }

    /// Unlinks both files immediately. The mapping stays valid until drop.
    pub fn remove_files(&self) -> Result<()> {
        remove_if_exists(self.key_file.path())?;
        remove_if_exists(self.data_file.path())?;
        Ok(())
    }

    /// Point lookup. `Some(empty)` is a tombstone; `None` means the key is
    /// not present in this segment.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let Some((offset, len)) = self.search(key)? else {
            return Ok(None);
        };
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }
        let data = self.data_file.slice(offset as usize, len as usize)?;
        Ok(Some(Bytes::copy_from_slice(data)))
    }

    pub fn lookup(
        self: &Arc<Self>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<Option<DiskIter>> {
        if self.key_file.len() == 0 {
            return Ok(None);
        }
        let mut block = 0u64;
        if let Some(lower) = lower {
            let index = self
                .key_index
                .partition_point(|first| (self.cmp)(lower, first) != std::cmp::Ordering::Less);
            let index = index.saturating_sub(1);
            block = (index * KEY_INDEX_INTERVAL) as u64;
        }
        DiskIter::new(Arc::clone(self), lower, upper, block).map(Some)
    }

    fn search(&self, key: &[u8]) -> Result<Option<(u64, u32)>> {
        // Narrow to a window of blocks with the sparse index.
        let index = self
            .key_index
            .partition_point(|first| (self.cmp)(key, first) != std::cmp::Ordering::Less);
        if index == 0 {
            // The key sorts before the first key in the file.
            return Ok(None);
        }
        let index = index - 1;

        let low = (index * KEY_INDEX_INTERVAL) as u64;
        let high = (low + KEY_INDEX_INTERVAL as u64).min(self.key_blocks - 1);

        let block = self.find_block(low, high, key)?;
        self.scan_block(block, key)
    }

    /// Binary search over block leaders. May return the block before the one
    /// holding the key, since only leading keys are consulted.
    fn find_block(&self, mut low: u64, mut high: u64, key: &[u8]) -> Result<u64> {
        while high - low > 1 {
            let mid = low + (high - low) / 2;
            if (self.cmp)(key, self.block_leader(mid)?) == std::cmp::Ordering::Less {
                high = mid;
            } else {
                low = mid;
            }
        }
        if high == low {
            return Ok(low);
        }
        if (self.cmp)(key, self.block_leader(high)?) == std::cmp::Ordering::Less {
            Ok(low)
        } else {
            Ok(high)
        }
    }

    /// The uncompressed first key of a block.
    fn block_leader(&self, block: u64) -> Result<&[u8]> {
        let base = block as usize * KEY_BLOCK_SIZE;
        let word = read_u16(self.key_file.slice(base, 2)?);
        if word & COMPRESSED_BIT != 0 {
            return Err(Error::Corrupted("block leader is compressed"));
        }
        if word as usize > MAX_KEY_SIZE {
            return Err(Error::Corrupted("block leader key too long"));
        }
        self.key_file.slice(base + 2, word as usize)
    }

    fn scan_block(&self, block: u64, key: &[u8]) -> Result<Option<(u64, u32)>> {
        let base = block as usize * KEY_BLOCK_SIZE;
        let buffer = self.key_file.slice(base, KEY_BLOCK_SIZE)?;

        let mut offset = 0usize;
        let mut prev_key: Vec<u8> = Vec::new();
        loop {
            let word = read_u16(
                buffer
                    .get(offset..offset + 2)
                    .ok_or(Error::Corrupted("key block overrun"))?,
            );
            if word == END_OF_BLOCK {
                return Ok(None);
            }
            let (prefix_len, suffix_len) = decode_key_len(word)?;
            let key_end = offset + 2 + suffix_len;
            let suffix = buffer
                .get(offset + 2..key_end)
                .ok_or(Error::Corrupted("key block overrun"))?;

            let entry_key = decode_key(suffix, &prev_key, prefix_len)?;

            let trailer = buffer
                .get(key_end..key_end + RECORD_TRAILER)
                .ok_or(Error::Corrupted("key block overrun"))?;

            match (self.cmp)(&entry_key, key) {
                std::cmp::Ordering::Equal => {
                    let data_offset = read_u64(&trailer[..8]);
                    let data_len = read_u32(&trailer[8..]);
                    return Ok(Some((data_offset, data_len)));
                }
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => {
                    prev_key = entry_key;
                    offset = key_end + RECORD_TRAILER;
                }
            }
        }
    }

    pub(crate) fn read_block(&self, block: u64, out: &mut [u8]) -> Result<()> {
        let base = block as usize * KEY_BLOCK_SIZE;
        out.copy_from_slice(self.key_file.slice(base, KEY_BLOCK_SIZE)?);
        Ok(())
    }

    pub(crate) fn key_blocks(&self) -> u64 {
        self.key_blocks
    }

    pub(crate) fn read_data(&self, offset: u64, len: u32) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let data = self.data_file.slice(offset as usize, len as usize)?;
        Ok(Bytes::copy_from_slice(data))
    }

    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        (self.cmp)(a, b)
    }
}

impl Drop for DiskSegment {
    fn drop(&mut self) {
        if self.remove_on_drop.load(Ordering::Relaxed) {
            let _ = remove_if_exists(self.key_file.path());
            let _ = remove_if_exists(self.data_file.path());
        }
    }
}

fn load_key_index(key_file: &MappedFile, key_blocks: u64) -> Result<Vec<Bytes>> {
    let mut key_index = Vec::new();
    if key_file.len() == 0 {
        return Ok(key_index);
    }
    let mut block = 0u64;
    while block < key_blocks {
        let base = block as usize * KEY_BLOCK_SIZE;
        let word = read_u16(key_file.slice(base, 2)?);
        if word == END_OF_BLOCK {
            break;
        }
        if word & COMPRESSED_BIT != 0 || word as usize > MAX_KEY_SIZE {
            return Err(Error::Corrupted("block leader malformed"));
        }
        let key = key_file.slice(base + 2, word as usize)?;
        key_index.push(Bytes::copy_from_slice(key));
        block += KEY_INDEX_INTERVAL as u64;
    }
    Ok(key_index)
}

/// Splits a key-length word into `(shared prefix, stored suffix)` lengths.
pub(crate) fn decode_key_len(word: u16) -> Result<(usize, usize)> {
    if word & COMPRESSED_BIT != 0 {
        let prefix_len = ((word >> 8) as usize) & MAX_PREFIX_LEN;
        let suffix_len = (word as usize) & MAX_SUFFIX_LEN;
        if suffix_len == 0 {
            return Err(Error::Corrupted("decoded key length is zero"));
        }
        Ok((prefix_len, suffix_len))
    } else {
        if word as usize > MAX_KEY_SIZE {
            return Err(Error::Corrupted("key length exceeds maximum"));
        }
        if word == 0 {
            return Err(Error::Corrupted("decoded key length is zero"));
        }
        Ok((0, word as usize))
    }
}

pub(crate) fn decode_key(suffix: &[u8], prev_key: &[u8], prefix_len: usize) -> Result<Vec<u8>> {
    if prefix_len == 0 {
        return Ok(suffix.to_vec());
    }
    let prefix = prev_key
        .get(..prefix_len)
        .ok_or(Error::Corrupted("shared prefix exceeds previous key"))?;
    let mut key = Vec::with_capacity(prefix_len + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    Ok(key)
}

pub(crate) fn read_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

pub(crate) fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

pub(crate) fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
