// quarry-core/src/storage/spill.rs
// Temporary spill files for blocking stages. Written sequentially as frames,
// read back through a memory map.

use std::fs::File;
use std::io::BufWriter;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ErrorCode, QuarryError, Result};
use crate::metrics::Metrics;

use super::frame;

/// Sequential writer of one spill file. The file is unlinked on creation and
/// disappears when the last handle is dropped.
pub struct SpillWriter {
    writer: BufWriter<File>,
    bytes: u64,
    records: u64,
}

impl SpillWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = tempfile::tempfile_in(dir)?;
        Ok(SpillWriter {
            writer: BufWriter::new(file),
            bytes: 0,
            records: 0,
        })
    }

    /// Offset the next record will be written at.
    pub fn position(&self) -> u64 {
        self.bytes
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<u64> {
        let offset = self.bytes;
        self.bytes += frame::write_frame(&mut self.writer, record)? as u64;
        self.records += 1;
        Ok(offset)
    }

    pub fn finish(self, metrics: Option<&Metrics>) -> Result<SpillFile> {
        let file = self.writer.into_inner().map_err(|e| QuarryError::Io(e.into_error()))?;
        file.sync_data()?;
        if let Some(metrics) = metrics {
            metrics.record_spill(self.bytes, self.records);
        }
        // Mapping an empty file fails on some platforms.
        let map = if self.bytes == 0 {
            None
        } else {
            // SAFETY: the file is private to this process (unlinked temp file)
            // and never written again after this point.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(SpillFile {
            map: Arc::new(map),
            bytes: self.bytes,
            records: self.records,
        })
    }
}

/// A finished, read-only spill file.
#[derive(Clone)]
pub struct SpillFile {
    map: Arc<Option<Mmap>>,
    bytes: u64,
    records: u64,
}

impl SpillFile {
    pub fn len_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    fn data(&self) -> &[u8] {
        match self.map.as_ref() {
            Some(map) => &map[..],
            None => &[],
        }
    }

    /// Decode the record at `offset`.
    pub fn read_at<T: DeserializeOwned>(&self, offset: u64) -> Result<T> {
        let data = self.data();
        let start = usize::try_from(offset).map_err(|_| corrupt())?;
        if start >= data.len() {
            return Err(corrupt());
        }
        frame::decode_required(&data[start..], "spill file").map(|(value, _)| value)
    }

    pub fn reader<T: DeserializeOwned>(&self) -> SpillReader<T> {
        self.reader_at(0)
    }

    pub fn reader_at<T: DeserializeOwned>(&self, offset: u64) -> SpillReader<T> {
        SpillReader {
            file: self.clone(),
            offset: offset as usize,
            _marker: PhantomData,
        }
    }
}

fn corrupt() -> QuarryError {
    QuarryError::new(ErrorCode::DataCorruptionDetected, "spill file offset out of range")
}

/// Streaming reader over a spill file.
pub struct SpillReader<T> {
    file: SpillFile,
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> SpillReader<T> {
    pub fn next_record(&mut self) -> Result<Option<T>> {
        let data = self.file.data();
        if self.offset >= data.len() {
            return Ok(None);
        }
        let (value, used) = frame::decode_required(&data[self.offset..], "spill file")?;
        self.offset += used;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spill_roundtrip_and_random_access() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Metrics::new();
        let mut writer = SpillWriter::create(dir.path()).unwrap();
        let mut offsets = Vec::new();
        for i in 0..50u32 {
            offsets.push(writer.write(&(i, format!("row{}", i))).unwrap());
        }
        let file = writer.finish(Some(&metrics)).unwrap();
        assert_eq!(file.records(), 50);
        assert_eq!(metrics.spills.get(), 1);
        assert_eq!(metrics.spilled_bytes.get(), file.len_bytes());

        let mut reader = file.reader::<(u32, String)>();
        let mut count = 0;
        while let Some((i, s)) = reader.next_record().unwrap() {
            assert_eq!(s, format!("row{}", i));
            count += 1;
        }
        assert_eq!(count, 50);

        let (i, _): (u32, String) = file.read_at(offsets[17]).unwrap();
        assert_eq!(i, 17);
    }

    #[test]
    fn test_empty_spill_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = SpillWriter::create(dir.path()).unwrap().finish(None).unwrap();
        assert!(file.reader::<u32>().next_record().unwrap().is_none());
        assert!(file.read_at::<u32>(0).is_err());
    }
}
