//! Append-only journal capturing every mutation of a memory segment.
//!
//! Stream framing (all integers little-endian):
//!
//! ```text
//! single record : i32 key len, key bytes, i32 value len, value bytes
//! batch start   : i32 = -N   (N > 0 entries follow)
//! batch body    : N single records
//! batch end     : i32 = -N   (must equal the start marker)
//! ```
//!
//! A zero-length value encodes a tombstone. Single records are flushed to the
//! OS after each write unless flushing is disabled; batches defer the flush
//! to the end marker. Sync mode pushes every flush to durable storage.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::db::options::{BatchReadMode, Options};
use crate::disk::MAX_KEY_SIZE;
use crate::error::{Error, Result};
use crate::skiplist::SkipList;

pub(crate) fn log_file_name(id: u64) -> String {
    format!("log.{id}")
}

pub(crate) struct LogFile {
    w: BufWriter<File>,
    path: PathBuf,
    in_batch: bool,
    sync_write: bool,
    disable_flush: bool,
}

impl LogFile {
    pub fn create(dir: &Path, id: u64, options: &Options) -> Result<Self> {
        let path = dir.join(log_file_name(id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            w: BufWriter::new(file),
            path,
            in_batch: false,
            sync_write: options.enable_sync_write,
            disable_flush: !options.enable_sync_write && options.disable_write_flush,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_batch(&mut self, len: usize) -> Result<()> {
        self.in_batch = true;
        self.w.write_all(&(-(len as i32)).to_le_bytes())?;
        Ok(())
    }

    pub fn end_batch(&mut self, len: usize) -> Result<()> {
        self.in_batch = false;
        self.w.write_all(&(-(len as i32)).to_le_bytes())?;
        self.flush()
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.w.write_all(&(key.len() as i32).to_le_bytes())?;
        self.w.write_all(key)?;
        self.w.write_all(&(value.len() as i32).to_le_bytes())?;
        self.w.write_all(value)?;
        if !self.in_batch && !self.disable_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        if self.sync_write {
            self.w.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

/// Replay a log file into a fresh skip list under the database comparator.
///
/// Truncation or corruption outside a batch always fails the open; inside a
/// batch the outcome is governed by [`BatchReadMode`].
pub(crate) fn read_log_file(path: &Path, options: &Options) -> Result<SkipList> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);
    let list = SkipList::new(options.key_compare());

    loop {
        let marker = match read_marker(&mut r)? {
            None => break,
            Some(marker) => marker,
        };
        if marker < 0 {
            if let Err(err) = read_batch(&mut r, marker, &list, options.batch_read_mode) {
                if options.batch_read_mode == BatchReadMode::ReturnOpenError {
                    return Err(err);
                }
                // Partial batch already resolved per mode; nothing after a
                // torn batch can be trusted.
                break;
            }
        } else {
            let (key, value) = read_record_body(&mut r, marker)?;
            list.put(key, value);
        }
    }
    Ok(list)
}

/// Reads the leading i32 of the next record, or `None` at a clean EOF.
fn read_marker(r: &mut BufReader<File>) -> Result<Option<i32>> {
    if r.fill_buf()?.is_empty() {
        return Ok(None);
    }
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(Some(i32::from_le_bytes(buf)))
}

fn read_i32(r: &mut BufReader<File>) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Reads the remainder of a single record whose key length has already been
/// consumed.
fn read_record_body(r: &mut BufReader<File>, key_len: i32) -> Result<(Bytes, Bytes)> {
    if key_len < 1 || key_len as usize > MAX_KEY_SIZE {
        return Err(Error::Corrupted("log record key length out of range"));
    }
    let mut key = vec![0u8; key_len as usize];
    r.read_exact(&mut key)?;

    let value_len = read_i32(r)?;
    if value_len < 0 {
        return Err(Error::Corrupted("log record value length negative"));
    }
    let mut value = vec![0u8; value_len as usize];
    r.read_exact(&mut value)?;

    Ok((Bytes::from(key), Bytes::from(value)))
}

fn read_batch(
    r: &mut BufReader<File>,
    marker: i32,
    list: &SkipList,
    mode: BatchReadMode,
) -> Result<()> {
    let count = marker.unsigned_abs() as usize;
    let mut entries = Vec::with_capacity(count);

    let framed = (|| -> Result<()> {
        for _ in 0..count {
            let key_len = read_i32(r)?;
            entries.push(read_record_body(r, key_len)?);
        }
        let end = read_i32(r)?;
        if end != marker {
            return Err(Error::Corrupted("batch end marker mismatch"));
        }
        Ok(())
    })();

    match framed {
        Ok(()) => {
            for (key, value) in entries {
                list.put(key, value);
            }
            Ok(())
        }
        Err(err) => {
            if mode == BatchReadMode::ApplyPartial {
                for (key, value) in entries {
                    list.put(key, value);
                }
            }
            Err(err)
        }
    }
}
