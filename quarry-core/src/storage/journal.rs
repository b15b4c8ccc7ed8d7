// quarry-core/src/storage/journal.rs
// Append-only commit journal.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::SyncMode;
use crate::error::Result;
use crate::log_warn;
use crate::oplog::JournalRecord;

use super::frame;

pub struct Journal {
    file: File,
    path: PathBuf,
    sync_mode: SyncMode,
    unsynced: usize,
}

impl Journal {
    /// Open or create the journal at `path`.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        Ok(Journal {
            file,
            path,
            sync_mode,
            unsynced: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let bytes = frame::encode(record)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&bytes)?;
        self.unsynced += 1;
        match self.sync_mode {
            SyncMode::Always => self.flush()?,
            SyncMode::Batch { commits } if self.unsynced >= commits.max(1) => self.flush()?,
            _ => {}
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Read every intact record. A torn or corrupt tail is cut off so later
    /// appends start on a frame boundary.
    pub fn read_all(&mut self) -> Result<Vec<JournalRecord>> {
        let mut buf = Vec::new();
        let mut reader = File::open(&self.path)?;
        reader.read_to_end(&mut buf)?;
        let (records, good) = frame::decode_all::<JournalRecord>(&buf);
        if good < buf.len() {
            log_warn!(
                "journal {} has {} trailing bytes that do not form a valid record; truncating",
                self.path.display(),
                buf.len() - good
            );
            self.file.set_len(good as u64)?;
            self.file.sync_all()?;
        }
        Ok(records)
    }

    /// Atomically replace the journal's contents with `records`.
    pub fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()> {
        let temp_path = self.path.with_extension("bin.tmp");
        {
            let mut temp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            for record in records {
                frame::write_frame(&mut temp, record)?;
            }
            temp.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.unsynced = 0;
        Ok(())
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
