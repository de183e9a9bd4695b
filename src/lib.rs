//! `stratadb` is an embedded, ordered key/value store built as a
//! log-structured merge tree.
//!
//! The engine is deliberately small and opinionated:
//! - Keys and values are opaque byte strings; keys are ordered by a
//!   configurable comparator that must be stable across sessions.
//! - Writes land in an in-memory skip list mirrored by an append-only log,
//!   so a crash replays cleanly on the next open.
//! - Frozen segments are immutable, memory-mapped, and prefix-compressed;
//!   a background merger bounds how many exist at once.
//! - Deletes are tombstones, preserved through merges until no older
//!   segment can hold a shadowed value.
//! - A database directory belongs to one process at a time, enforced with
//!   an advisory file lock; within the process the handle is thread-safe.
//!
//! ```no_run
//! use stratadb::{Db, Options};
//!
//! # fn main() -> stratadb::Result<()> {
//! let db = Db::open(
//!     "./mydb",
//!     Options {
//!         create_if_needed: true,
//!         ..Options::default()
//!     },
//! )?;
//! db.put("mykey", "myvalue")?;
//! assert_eq!(db.get(b"mykey")?.as_ref(), b"myvalue");
//! db.close()?;
//! # Ok(())
//! # }
//! ```

mod db;
mod deleter;
mod disk;
mod error;
mod log;
mod logseg;
mod memory;
mod merger;
mod multi;
mod segment;
mod skiplist;

pub use db::{
    is_valid_database, BatchReadMode, Db, DbIterator, KeyCompare, Options, Snapshot, Stats,
    WriteBatch,
};
pub use error::{Error, Result};
