//! Crash-safe multi-file deletion.
//!
//! Compaction must delete several files that together still hold live data
//! until the replacement segment is durable. Instead of unlinking directly,
//! obsolete files are journaled to `<db>/deleted` (one comma-separated line
//! per schedule, synced on append) and physically removed by the next sweep,
//! which runs at open and at close. Replacement files are published with
//! tmp-then-rename, so each journaled line can be applied unconditionally.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

const DELETED_FILE: &str = "deleted";

pub(crate) struct Deleter {
    dir: PathBuf,
    file: Mutex<Option<File>>,
}

impl Deleter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file: Mutex::new(None),
        }
    }

    /// Durably records that `files` are obsolete. They keep existing until
    /// the next sweep.
    pub fn schedule_deletion(&self, files: &[String]) -> Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.dir.join(DELETED_FILE))?,
            );
        }
        let file = guard.as_mut().expect("deletion journal open");
        writeln!(file, "{}", files.join(","))?;
        file.sync_data()?;
        Ok(())
    }

    /// Unlinks every journaled file, then removes the journal itself.
    /// Files already gone are fine; a crash mid-sweep just replays the
    /// remainder on the next open.
    pub fn delete_scheduled(&self) -> Result<()> {
        let mut guard = self.file.lock();
        *guard = None;

        let path = self.dir.join(DELETED_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for line in BufReader::new(file).lines() {
            let line = line?;
            for name in line.split(',').filter(|name| !name.is_empty()) {
                match std::fs::remove_file(self.dir.join(name)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_removes_scheduled_files() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("keys.1.1"), b"x")?;
        std::fs::write(dir.path().join("data.1.1"), b"y")?;
        std::fs::write(dir.path().join("keys.2.2"), b"z")?;

        let deleter = Deleter::new(dir.path());
        deleter.schedule_deletion(&["keys.1.1".into(), "data.1.1".into()])?;
        assert!(dir.path().join("keys.1.1").exists());
        assert!(dir.path().join(DELETED_FILE).exists());

        deleter.delete_scheduled()?;
        assert!(!dir.path().join("keys.1.1").exists());
        assert!(!dir.path().join("data.1.1").exists());
        assert!(dir.path().join("keys.2.2").exists());
        assert!(!dir.path().join(DELETED_FILE).exists());
        Ok(())
    }

    #[test]
    fn sweep_tolerates_already_deleted_files() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let deleter = Deleter::new(dir.path());
        deleter.schedule_deletion(&["keys.9.9".into()])?;
        deleter.delete_scheduled()?;
        deleter.delete_scheduled()?;
        Ok(())
    }

    #[test]
    fn journal_survives_until_swept() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("log.3"), b"x")?;
        {
            let deleter = Deleter::new(dir.path());
            deleter.schedule_deletion(&["log.3".into()])?;
            // Dropped without sweeping, as a crash would.
        }
        assert!(dir.path().join("log.3").exists());

        let deleter = Deleter::new(dir.path());
        deleter.delete_scheduled()?;
        assert!(!dir.path().join("log.3").exists());
        Ok(())
    }
}
