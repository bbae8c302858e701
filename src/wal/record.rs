//! WAL record frame
//!
//! Binary format (all little-endian):
//! ┌──────────┬────────────┬────────┬───────────┬─────────────┐
//! │ KeySize  │ ValueSize  │ Flag   │ Key Bytes │ Value Bytes │
//! │ 4 bytes  │ 4 bytes    │ 1 byte │ key-size  │ value-size  │
//! └──────────┴────────────┴────────┴───────────┴─────────────┘
//!
//! Flag `P` marks a pending record, `C` a committed one (rewritten in place),
//! and `D` a delete record whose value size is zero.

use crate::defaults::WAL_HEADER_SIZE;
use crate::error::{DbError, Result};

/// Commit state of a WAL record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFlag {
    Pending,
    Committed,
    Delete,
}

impl RecordFlag {
    pub fn as_byte(self) -> u8 {
        match self {
            RecordFlag::Pending => b'P',
            RecordFlag::Committed => b'C',
            RecordFlag::Delete => b'D',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'P' => Ok(RecordFlag::Pending),
            b'C' => Ok(RecordFlag::Committed),
            b'D' => Ok(RecordFlag::Delete),
            other => Err(DbError::invariant(format!(
                "unknown WAL flag byte 0x{other:02x}"
            ))),
        }
    }
}

/// A decoded WAL record
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flag: RecordFlag,
}

impl WalRecord {
    /// Serialize the record into its on-disk frame
    pub fn encode(key: &[u8], value: &[u8], flag: RecordFlag) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WAL_HEADER_SIZE + key.len() + value.len());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.push(flag.as_byte());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    /// Decode one frame from `data`, returning the record and its total size.
    ///
    /// Returns `Ok(None)` when the remaining bytes form a truncated tail,
    /// which replay ignores.
    pub fn decode(data: &[u8]) -> Result<Option<(WalRecord, usize)>> {
        if data.len() < WAL_HEADER_SIZE {
            return Ok(None);
        }

        let key_size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let value_size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        let flag = RecordFlag::from_byte(data[8])?;

        let total = WAL_HEADER_SIZE + key_size + value_size;
        if data.len() < total {
            // Truncated tail: the header promises more bytes than remain
            return Ok(None);
        }

        let key = data[WAL_HEADER_SIZE..WAL_HEADER_SIZE + key_size].to_vec();
        let value = data[WAL_HEADER_SIZE + key_size..total].to_vec();

        Ok(Some((WalRecord { key, value, flag }, total)))
    }
}
