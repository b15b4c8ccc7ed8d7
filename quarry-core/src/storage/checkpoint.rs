// quarry-core/src/storage/checkpoint.rs
// Consistent on-disk image of every collection at one timestamp.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::Result;
use crate::txn::{Timestamp, TxnId};

use super::frame;
use super::RecordId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexImage {
    /// The index spec as given to `createIndexes` (`key`, `name`, options).
    pub spec: Document,
    pub multikey: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionImage {
    pub ns: String,
    pub uuid: String,
    pub created_ts: Timestamp,
    pub options: Document,
    pub indexes: Vec<IndexImage>,
    pub records: Vec<(RecordId, Document)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub ts: Timestamp,
    pub next_txn_id: TxnId,
    pub collections: usize,
}

/// Write `collections` as a checkpoint at `ts`. The file is written next to
/// its destination and renamed into place.
pub fn write_checkpoint(
    path: &Path,
    ts: Timestamp,
    next_txn_id: TxnId,
    collections: &[CollectionImage],
) -> Result<()> {
    let temp_path = path.with_extension("bin.tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        let header = CheckpointHeader {
            ts,
            next_txn_id,
            collections: collections.len(),
        };
        frame::write_frame(&mut writer, &header)?;
        for collection in collections {
            frame::write_frame(&mut writer, collection)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a checkpoint. A missing file is an empty checkpoint; a damaged one
/// is an error.
pub fn read_checkpoint(path: &Path) -> Result<Option<(CheckpointHeader, Vec<CollectionImage>)>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    let (header, mut offset): (CheckpointHeader, usize) = frame::decode_required(&buf, "checkpoint header")?;
    let mut collections = Vec::with_capacity(header.collections);
    for _ in 0..header.collections {
        let (image, used): (CollectionImage, usize) = frame::decode_required(&buf[offset..], "checkpoint")?;
        offset += used;
        collections.push(image);
    }
    Ok(Some((header, collections)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::error::ErrorCode;

    fn image() -> CollectionImage {
        CollectionImage {
            ns: "test.c".into(),
            uuid: "u".into(),
            created_ts: 1,
            options: Document::new(),
            indexes: vec![IndexImage {
                spec: doc!({"key": {"a": 1}, "name": "a_1"}),
                multikey: true,
            }],
            records: vec![(1, doc!({"_id": 1, "a": [1, 2]}))],
        }
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        assert!(read_checkpoint(&path).unwrap().is_none());
        write_checkpoint(&path, 42, 7, &[image()]).unwrap();

        let (header, collections) = read_checkpoint(&path).unwrap().unwrap();
        assert_eq!(header.ts, 42);
        assert_eq!(header.next_txn_id, 7);
        assert_eq!(collections.len(), 1);
        assert!(collections[0].indexes[0].multikey);
        assert_eq!(collections[0].records[0].1, doc!({"_id": 1, "a": [1, 2]}));
    }

    #[test]
    fn test_damaged_checkpoint_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        write_checkpoint(&path, 1, 1, &[image()]).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 3).unwrap();
        let err = read_checkpoint(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataCorruptionDetected);
    }
}
