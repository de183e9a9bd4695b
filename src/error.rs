use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public API.
///
/// Background merge failures are latched inside the database and re-surfaced
/// as [`Error::Background`] on every subsequent call until close.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("key too long, max 1024")]
    KeyTooLong,

    #[error("key is empty")]
    EmptyKey,

    #[error("database closed")]
    DatabaseClosed,

    #[error("database in use")]
    DatabaseInUse,

    #[error("snapshot closed")]
    SnapshotClosed,

    #[error("no database found")]
    NoDatabaseFound,

    #[error("path is not a directory")]
    NotADirectory,

    #[error("path is not a valid database")]
    NotValidDatabase,

    #[error("database corrupted: {0}")]
    Corrupted(&'static str),

    #[error("background merge failed: {0}")]
    Background(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the "key is absent" outcome, as opposed to a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound)
    }
}
