use fluxkv::persistence::{
    DurabilityLevel, PersistenceEngine, PersistenceOptions, RecordType, RecoveryIterator, WalRecord, HEADER_LEN,
};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn open_full(path: &Path) -> PersistenceEngine {
    PersistenceEngine::open(&DurabilityLevel::Full {
        options: PersistenceOptions::new(path),
    })
    .unwrap()
    .unwrap()
}

fn read_all(path: &Path) -> Vec<WalRecord> {
    RecoveryIterator::open(path)
        .unwrap()
        .map(|record| record.unwrap())
        .collect()
}

fn record(txn_id: u64, record_type: RecordType, key: &[u8], value: &[u8]) -> WalRecord {
    WalRecord {
        txn_id,
        record_type,
        table_id: 0,
        sequence: 0,
        key: key.to_vec(),
        value: value.to_vec(),
    }
}

#[test]
fn test_in_memory_durability_has_no_engine() {
    assert!(PersistenceEngine::open(&DurabilityLevel::InMemory).unwrap().is_none());
}

#[test]
fn test_records_read_back_bit_identical() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fluxkv.wal");
    let written = vec![
        record(1, RecordType::Put, b"alpha", b"first value"),
        record(1, RecordType::Delete, b"beta", b""),
        WalRecord {
            table_id: 9,
            ..record(1, RecordType::Put, &[0u8, 255, 7], &vec![0x5A; 3000])
        },
        record(1, RecordType::Commit, b"", b""),
        record(2, RecordType::Abort, b"", b""),
    ];
    {
        let wal = open_full(&path);
        for r in &written {
            wal.append(r).unwrap();
        }
        wal.sync().unwrap();
    }

    let read = read_all(&path);
    assert_eq!(read.len(), written.len());
    for (i, (got, want)) in read.iter().zip(&written).enumerate() {
        assert_eq!(got.sequence, i as u64 + 1);
        assert_eq!(
            got,
            &WalRecord {
                sequence: got.sequence,
                ..want.clone()
            }
        );
    }
}

#[test]
fn test_log_layout_matches_encoded_length() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fluxkv.wal");
    let wal = open_full(&path);
    wal.append_entry(1, RecordType::Put, b"key", b"value").unwrap();
    wal.append_entry(1, RecordType::Commit, b"", b"").unwrap();
    wal.sync().unwrap();

    let expected = (HEADER_LEN + 3 + 5 + HEADER_LEN) as u64;
    assert_eq!(fs::metadata(&path).unwrap().len(), expected);
    assert_eq!(wal.stats().bytes_written, expected);

    // Header fields are little-endian: txn_id, type, table_id, key_size, value_size, sequence.
    let bytes = fs::read(&path).unwrap();
    assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0);
    assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 3);
    assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 5);
    assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 1);
    assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 3], b"key");
}

#[test]
fn test_partial_tail_yields_only_complete_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fluxkv.wal");
    {
        let wal = open_full(&path);
        for i in 0..3u8 {
            wal.append_entry(1, RecordType::Put, &[b'k', i], &[i; 10]).unwrap();
        }
        wal.sync().unwrap();
    }
    let record_len = (HEADER_LEN + 2 + 10) as u64;
    assert_eq!(fs::metadata(&path).unwrap().len(), 3 * record_len);

    // Two and a half records.
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(2 * record_len + record_len / 2)
        .unwrap();
    let read = read_all(&path);
    assert_eq!(read.len(), 2);
    assert_eq!(read[1].key, vec![b'k', 1]);

    let mut iter = RecoveryIterator::open(&path).unwrap();
    assert_eq!(iter.by_ref().count(), 2);
    assert_eq!(iter.valid_offset(), 2 * record_len);
    assert_eq!(iter.last_sequence(), 2);

    // One and a half.
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(record_len + 7)
        .unwrap();
    assert_eq!(read_all(&path).len(), 1);
}

#[test]
fn test_corrupted_record_ends_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fluxkv.wal");
    {
        let wal = open_full(&path);
        for i in 0..3u8 {
            wal.append_entry(1, RecordType::Put, &[b'k', i], b"payload").unwrap();
        }
        wal.sync().unwrap();
    }
    let record_len = (HEADER_LEN + 2 + 7) as u64;

    // Flip one byte of the second record's value.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(record_len + HEADER_LEN as u64 + 3)).unwrap();
    file.write_all(b"X").unwrap();
    drop(file);

    let read = read_all(&path);
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].key, b"k\x00".to_vec());

    // Reopening truncates the log to the good prefix and continues after it.
    let wal = open_full(&path);
    assert_eq!(wal.recovered().records, 1);
    assert_eq!(wal.recovered().truncated_bytes, 2 * record_len);
    assert_eq!(wal.append_entry(2, RecordType::Put, b"new", b"v").unwrap(), 2);
    wal.sync().unwrap();
    drop(wal);
    assert_eq!(read_all(&path).len(), 2);
}

#[test]
fn test_reopen_continues_the_sequence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("dir").join("fluxkv.wal");
    for round in 0..3u64 {
        let wal = open_full(&path);
        assert_eq!(wal.recovered().records, round * 2);
        let first = wal.append_entry(round + 1, RecordType::Put, b"k", b"v").unwrap();
        wal.append_entry(round + 1, RecordType::Commit, b"", b"").unwrap();
        assert_eq!(first, round * 2 + 1);
    }

    let sequences: Vec<u64> = read_all(&path).iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (1..=6).collect::<Vec<_>>());
}

#[test]
fn test_drop_flushes_buffered_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fluxkv.wal");
    {
        let wal = open_full(&path);
        wal.append_entry(1, RecordType::Put, b"k", b"v").unwrap();
        assert_eq!(wal.stats().bytes_written, 0);
    }
    assert_eq!(read_all(&path).len(), 1);
}

#[test]
fn test_concurrent_appends_and_syncs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fluxkv.wal");
    let threads = 8u64;
    let per_thread = 50u64;
    {
        let wal = Arc::new(open_full(&path));
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let wal = Arc::clone(&wal);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let seq = wal.append_entry(t, RecordType::Put, &i.to_le_bytes(), b"v").unwrap();
                        wal.sync_through(seq, Some(Duration::from_secs(10))).unwrap();
                        assert!(wal.stats().synced_sequence >= seq);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = wal.stats();
        assert_eq!(stats.last_sequence, threads * per_thread);
        assert!(stats.syncs >= 1);
    }

    let read = read_all(&path);
    assert_eq!(read.len() as u64, threads * per_thread);
    for (i, r) in read.iter().enumerate() {
        assert_eq!(r.sequence, i as u64 + 1);
    }
    for t in 0..threads {
        assert_eq!(read.iter().filter(|r| r.txn_id == t).count() as u64, per_thread);
    }
}

#[test]
fn test_relaxed_mode_flushes_in_the_background() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("relaxed.wal");
    let wal = PersistenceEngine::open(&DurabilityLevel::Relaxed {
        options: PersistenceOptions::new(&path),
        flush_interval_ms: 10,
    })
    .unwrap()
    .unwrap();
    wal.append_entry(1, RecordType::Put, b"k", b"v").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while wal.stats().synced_sequence < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(wal.stats().synced_sequence, 1);
    assert!(wal.stats().syncs >= 1);
    assert_eq!(read_all(&path).len(), 1);
}
