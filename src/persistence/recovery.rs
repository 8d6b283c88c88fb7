//! Sequential reading of a WAL file at startup.

use super::record::{Header, RecordType, WalRecord, HEADER_LEN};
use crate::error::Result;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Reads records from the start of a WAL file in sequence order.
///
/// Iteration ends at the first record that is cut short, fails its checksum,
/// has an unknown type, or does not continue the sequence. Everything before
/// that point, up to [`valid_offset`](Self::valid_offset), is trusted.
///
/// Only I/O failures other than a short read are yielded as errors.
#[derive(Debug)]
pub struct RecoveryIterator {
    reader: BufReader<File>,
    file_len: u64,
    offset: u64,
    last_sequence: u64,
    done: bool,
}

impl RecoveryIterator {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(RecoveryIterator {
            reader: BufReader::new(file),
            file_len,
            offset: 0,
            last_sequence: 0,
            done: false,
        })
    }

    /// Byte length of the valid prefix read so far.
    pub fn valid_offset(&self) -> u64 {
        self.offset
    }

    /// Sequence number of the last valid record read, or 0.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Starts over from the first record.
    pub fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.offset = 0;
        self.last_sequence = 0;
        self.done = false;
        Ok(())
    }

    fn read_record(&mut self) -> io::Result<Option<WalRecord>> {
        let mut raw = [0u8; HEADER_LEN];
        if !read_full(&mut self.reader, &mut raw)? {
            return Ok(None);
        }
        let header = Header::parse(&raw);

        let remaining = self.file_len.saturating_sub(self.offset + HEADER_LEN as u64);
        if header.body_len() > remaining {
            debug!(offset = self.offset, "record body runs past end of file");
            return Ok(None);
        }
        let Some(record_type) = RecordType::from_u32(header.record_type) else {
            debug!(offset = self.offset, raw_type = header.record_type, "unknown record type");
            return Ok(None);
        };
        if header.sequence <= self.last_sequence {
            debug!(offset = self.offset, sequence = header.sequence, "sequence does not advance");
            return Ok(None);
        }

        let mut key = vec![0u8; header.key_size as usize];
        let mut value = vec![0u8; header.value_size as usize];
        if !read_full(&mut self.reader, &mut key)? || !read_full(&mut self.reader, &mut value)? {
            return Ok(None);
        }
        if !header.verify(&raw, &key, &value) {
            debug!(offset = self.offset, sequence = header.sequence, "checksum mismatch");
            return Ok(None);
        }

        self.offset += HEADER_LEN as u64 + header.body_len();
        self.last_sequence = header.sequence;
        Ok(Some(WalRecord {
            txn_id: header.txn_id,
            record_type,
            table_id: header.table_id,
            sequence: header.sequence,
            key,
            value,
        }))
    }
}

/// Fills `buf`, returning `false` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl Iterator for RecoveryIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}
