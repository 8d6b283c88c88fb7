//! The on-disk record format of the write-ahead log.
//!
//! Records are written back to back. Each one is a fixed 36-byte header
//! followed by `key_size` key bytes and `value_size` value bytes. All integers
//! are little-endian.
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 8    | `txn_id`     |
//! | 8      | 4    | `type`       |
//! | 12     | 4    | `table_id`   |
//! | 16     | 4    | `key_size`   |
//! | 20     | 4    | `value_size` |
//! | 24     | 8    | `sequence`   |
//! | 32     | 4    | `checksum`   |
//!
//! The checksum is CRC-32 over header bytes `0..32`, then the key, then the value.

use crate::transaction::TxId;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 36;

const CHECKSUM_OFFSET: usize = 32;

/// The table every record is written to; the engine has a single keyspace.
pub const DEFAULT_TABLE_ID: u32 = 0;

/// The kind of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordType {
    Put = 1,
    Delete = 2,
    /// Closes a transaction's write set. Recovery applies nothing without it.
    Commit = 3,
    /// Retracts an indeterminate commit.
    Abort = 4,
}

impl RecordType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RecordType::Put),
            2 => Some(RecordType::Delete),
            3 => Some(RecordType::Commit),
            4 => Some(RecordType::Abort),
            _ => None,
        }
    }
}

/// A decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub txn_id: TxId,
    pub record_type: RecordType,
    pub table_id: u32,
    pub sequence: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalRecord {
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.key.len() + self.value.len()
    }

    /// Appends the serialized record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        encode_parts(
            buf,
            self.txn_id,
            self.record_type,
            self.table_id,
            self.sequence,
            &self.key,
            &self.value,
        );
    }
}

/// Serializes one record into `buf` without building a [`WalRecord`] first.
///
/// Callers validate that `key` and `value` lengths fit in a `u32`.
pub(crate) fn encode_parts(
    buf: &mut Vec<u8>,
    txn_id: TxId,
    record_type: RecordType,
    table_id: u32,
    sequence: u64,
    key: &[u8],
    value: &[u8],
) {
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(&txn_id.to_le_bytes());
    header[8..12].copy_from_slice(&(record_type as u32).to_le_bytes());
    header[12..16].copy_from_slice(&table_id.to_le_bytes());
    header[16..20].copy_from_slice(&(key.len() as u32).to_le_bytes());
    header[20..24].copy_from_slice(&(value.len() as u32).to_le_bytes());
    header[24..32].copy_from_slice(&sequence.to_le_bytes());
    let crc = checksum(&header[..CHECKSUM_OFFSET], key, value);
    header[CHECKSUM_OFFSET..].copy_from_slice(&crc.to_le_bytes());

    buf.extend_from_slice(&header);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

pub(crate) fn checksum(header: &[u8], key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// The fields of a raw header, before any validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub txn_id: TxId,
    pub record_type: u32,
    pub table_id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub sequence: u64,
    pub checksum: u32,
}

impl Header {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        Header {
            txn_id: u64_at(0),
            record_type: u32_at(8),
            table_id: u32_at(12),
            key_size: u32_at(16),
            value_size: u32_at(20),
            sequence: u64_at(24),
            checksum: u32_at(CHECKSUM_OFFSET),
        }
    }

    pub fn body_len(&self) -> u64 {
        self.key_size as u64 + self.value_size as u64
    }

    /// Checks the stored checksum against the header prefix and body.
    pub fn verify(&self, raw: &[u8; HEADER_LEN], key: &[u8], value: &[u8]) -> bool {
        checksum(&raw[..CHECKSUM_OFFSET], key, value) == self.checksum
    }
}
