//! Disk segment writer.
//!
//! Streams a sorted record iterator into `.tmp` key/data files, renames them
//! into place, fsyncs the directory, then maps the result. The final names
//! must not already exist.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::db::options::KeyCompare;
use crate::error::Result;
use crate::segment::{data_file_name, keys_file_name};

use super::{
    DiskSegment, END_OF_BLOCK, COMPRESSED_BIT, KEY_BLOCK_SIZE, KEY_INDEX_INTERVAL, MAX_PREFIX_LEN,
    MAX_SUFFIX_LEN, RECORD_TRAILER,
};

pub(crate) fn write_and_load_segment(
    dir: &Path,
    lower_id: u64,
    upper_id: u64,
    records: impl Iterator<Item = Result<(Bytes, Bytes)>>,
    purge_deleted: bool,
    cmp: KeyCompare,
) -> Result<Arc<DiskSegment>> {
    let key_path = dir.join(keys_file_name(lower_id, upper_id));
    let data_path = dir.join(data_file_name(lower_id, upper_id));

    for path in [&key_path, &data_path] {
        if path.try_exists()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("segment file already exists: {}", path.display()),
            )
            .into());
        }
    }

    let key_tmp = key_path.with_extension(tmp_extension(&key_path));
    let data_tmp = data_path.with_extension(tmp_extension(&data_path));

    let key_index = match write_segment_files(&key_tmp, &data_tmp, records, purge_deleted) {
        Ok(index) => index,
        Err(err) => {
            let _ = std::fs::remove_file(&key_tmp);
            let _ = std::fs::remove_file(&data_tmp);
            return Err(err);
        }
    };

    std::fs::rename(&key_tmp, &key_path)?;
    std::fs::rename(&data_tmp, &data_path)?;
    fsync_parent_dir(&key_path)?;

    DiskSegment::open(key_path, data_path, Some(key_index), cmp)
}

// `with_extension` replaces everything after the last dot, so rebuild the
// full `<upper>.tmp` suffix instead of appending blindly.
fn tmp_extension(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    }
}

fn write_segment_files(
    key_path: &Path,
    data_path: &Path,
    records: impl Iterator<Item = Result<(Bytes, Bytes)>>,
    purge_deleted: bool,
) -> Result<Vec<Bytes>> {
    let mut key_w = BufWriter::new(File::create(key_path)?);
    let mut data_w = BufWriter::new(File::create(data_path)?);

    let zeros = [0u8; KEY_BLOCK_SIZE];
    let mut key_index: Vec<Bytes> = Vec::new();
    let mut data_offset = 0u64;
    let mut block_len = 0usize;
    let mut blocks_started = 0usize;
    let mut prev_key: Option<Bytes> = None;

    for record in records {
        let (key, value) = record?;
        if purge_deleted && value.is_empty() {
            continue;
        }

        data_w.write_all(&value)?;

        // The fit check uses the full key length so the layout does not
        // depend on how well the key compresses. Leave room for the
        // end-of-block marker.
        if block_len + 2 + key.len() + RECORD_TRAILER >= KEY_BLOCK_SIZE - 2 {
            key_w.write_all(&END_OF_BLOCK.to_le_bytes())?;
            block_len += 2;
            key_w.write_all(&zeros[..KEY_BLOCK_SIZE - block_len])?;
            block_len = 0;
            prev_key = None;
        }

        if block_len == 0 {
            if blocks_started % KEY_INDEX_INTERVAL == 0 {
                key_index.push(key.clone());
            }
            blocks_started += 1;
        }

        let (word, suffix_start) = encode_key(&key, prev_key.as_deref());
        let suffix = &key[suffix_start..];
        key_w.write_all(&word.to_le_bytes())?;
        key_w.write_all(suffix)?;
        key_w.write_all(&(data_offset as i64).to_le_bytes())?;
        key_w.write_all(&(value.len() as u32).to_le_bytes())?;

        block_len += 2 + suffix.len() + RECORD_TRAILER;
        data_offset += value.len() as u64;
        prev_key = Some(key);
    }

    if block_len > 0 && block_len < KEY_BLOCK_SIZE {
        key_w.write_all(&END_OF_BLOCK.to_le_bytes())?;
        block_len += 2;
        key_w.write_all(&zeros[..KEY_BLOCK_SIZE - block_len])?;
    }

    key_w.flush()?;
    key_w.get_ref().sync_data()?;
    data_w.flush()?;
    data_w.get_ref().sync_data()?;
    Ok(key_index)
}

/// Returns the key-length word and the offset where the stored suffix starts.
fn encode_key(key: &[u8], prev_key: Option<&[u8]>) -> (u16, usize) {
    let prefix_len = shared_prefix_len(prev_key, key);
    if prefix_len > 0 {
        let suffix_len = key.len() - prefix_len;
        let word = COMPRESSED_BIT | ((prefix_len as u16) << 8) | suffix_len as u16;
        (word, prefix_len)
    } else {
        (key.len() as u16, 0)
    }
}

fn shared_prefix_len(prev_key: Option<&[u8]>, key: &[u8]) -> usize {
    let Some(prev_key) = prev_key else {
        return 0;
    };
    let mut len = 0;
    while len < prev_key.len() && len < key.len() && prev_key[len] == key[len] {
        len += 1;
    }
    // Fall back to an uncompressed key when the encoding cannot express the
    // prefix or suffix length.
    if len > MAX_PREFIX_LEN || key.len() - len > MAX_SUFFIX_LEN {
        len = 0;
    }
    len
}

fn fsync_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "missing parent dir"))?;
    File::open(parent)?.sync_all()?;
    Ok(())
}
