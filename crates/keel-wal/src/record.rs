//! On-disk record framing.
//!
//! Record format:
//! - len: u32 (little-endian, payload length)
//! - crc32c: u32 (little-endian, over the payload)
//! - payload: bincode-encoded log entry
//!
//! Decoding distinguishes a truncated tail (torn write at the end of a
//! file, recoverable by truncation) from a checksum mismatch (corruption).

use bytes::BufMut;
use keel_raft::LogEntry;
use thiserror::Error;

/// Bytes of framing before the payload.
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// The buffer ends mid-record.
    #[error("record truncated")]
    Truncated,

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Encode one entry into a framed record.
pub fn encode(entry: &LogEntry) -> Result<Vec<u8>, RecordError> {
    let payload = bincode::serialize(entry)?;
    let crc = crc32c::crc32c(&payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one record from the front of `buf`.
///
/// Returns the entry and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(LogEntry, usize), RecordError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(RecordError::Truncated);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[4..8]);
    let expected = u32::from_le_bytes(crc_bytes);

    if buf.len() < FRAME_HEADER_LEN + len {
        return Err(RecordError::Truncated);
    }

    let payload = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
    let actual = crc32c::crc32c(payload);
    if actual != expected {
        return Err(RecordError::CrcMismatch { expected, actual });
    }

    let entry = bincode::deserialize(payload)?;
    Ok((entry, FRAME_HEADER_LEN + len))
}
