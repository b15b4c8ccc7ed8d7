// quarry-core/src/storage/frame.rs
// Checksummed frame codec shared by the journal, checkpoints and spill runs.
//
// Layout: [len: u32 LE][crc32: u32 LE][bincode payload; len bytes]

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ErrorCode, QuarryError, Result};

pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single frame, guards against allocating from a garbage
/// length field.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Result of decoding one frame from the front of a buffer.
pub enum Decoded<T> {
    /// A value and the total number of bytes it occupied.
    Frame(T, usize),
    /// Not enough bytes for a whole frame (end of data or torn write).
    Incomplete,
    /// Length or checksum did not verify.
    Corrupt,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(QuarryError::new(
            ErrorCode::BsonObjectTooLarge,
            format!("frame of {} bytes exceeds the frame limit", payload.len()),
        ));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame, returning the number of bytes written.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<usize> {
    let frame = encode(value)?;
    writer.write_all(&frame)?;
    Ok(frame.len())
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Decoded<T> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Decoded::Incomplete;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len > MAX_FRAME_SIZE {
        return Decoded::Corrupt;
    }
    let end = FRAME_HEADER_SIZE + len;
    if buf.len() < end {
        return Decoded::Incomplete;
    }
    let payload = &buf[FRAME_HEADER_SIZE..end];
    if crc32fast::hash(payload) != crc {
        return Decoded::Corrupt;
    }
    match bincode::deserialize(payload) {
        Ok(value) => Decoded::Frame(value, end),
        Err(_) => Decoded::Corrupt,
    }
}

/// Decode a frame that must be present and valid.
pub fn decode_required<T: DeserializeOwned>(buf: &[u8], what: &str) -> Result<(T, usize)> {
    match decode(buf) {
        Decoded::Frame(value, used) => Ok((value, used)),
        Decoded::Incomplete => Err(QuarryError::new(
            ErrorCode::DataCorruptionDetected,
            format!("{} is truncated", what),
        )),
        Decoded::Corrupt => Err(QuarryError::new(
            ErrorCode::DataCorruptionDetected,
            format!("{} failed its checksum", what),
        )),
    }
}

/// Decode every complete frame in `buf`. Returns the values and the offset
/// just past the last good frame; anything after it is a torn or corrupt tail.
pub fn decode_all<T: DeserializeOwned>(buf: &[u8]) -> (Vec<T>, usize) {
    let mut values = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match decode(&buf[offset..]) {
            Decoded::Frame(value, used) => {
                values.push(value);
                offset += used;
            }
            Decoded::Incomplete | Decoded::Corrupt => break,
        }
    }
    (values, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stops_at_torn_tail() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &"first".to_string()).unwrap();
        write_frame(&mut buf, &"second".to_string()).unwrap();
        let good = buf.len();
        let third = encode(&"third".to_string()).unwrap();
        buf.extend_from_slice(&third[..third.len() - 2]);

        let (values, end): (Vec<String>, usize) = decode_all(&buf);
        assert_eq!(values, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(end, good);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let mut frame = encode(&42u64).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode::<u64>(&frame), Decoded::Corrupt));
        let err = decode_required::<u64>(&frame, "spill run").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataCorruptionDetected);
    }

    #[test]
    fn test_short_header_is_incomplete() {
        assert!(matches!(decode::<u64>(&[1, 2, 3]), Decoded::Incomplete));
    }
}
