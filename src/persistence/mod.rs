//! Manages data durability through a write-ahead log (WAL).
//!
//! Every committed transaction's write set is appended to the log, followed by
//! a COMMIT record, before any of its versions become visible. On restart the
//! log is replayed to rebuild the version store.
//!
//! # Strategy
//!
//! 1.  **Buffered appends:** records are serialized into an in-memory buffer
//!     guarded by a mutex. A full buffer is written out synchronously by the
//!     appending thread.
//!
//! 2.  **Group commit:** with group commit enabled, the durability barrier is
//!     deferred until a batch of records closes, either because it reached
//!     `group_commit_max_records` or because a caller asked for a sync. A
//!     dedicated syncer thread drains all sync requests that arrived while it
//!     was busy and answers them with a single `fsync`.
//!
//! 3.  **Relaxed durability:** in `Relaxed` mode explicit syncs only hand the
//!     buffer to the operating system; the syncer flushes with a barrier every
//!     `flush_interval_ms` in the background.
//!
//! 4.  **Tail repair:** opening an existing log scans it and truncates anything
//!     after the last valid record, so appends continue from a clean tail.

pub mod record;
pub mod recovery;

pub use record::{RecordType, WalRecord, DEFAULT_TABLE_ID, HEADER_LEN};
pub use recovery::RecoveryIterator;

use crate::error::{FluxError, Result};
use crate::metrics as m;
use crate::transaction::TxId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default size of the in-memory append buffer.
pub const DEFAULT_BUFFER_CAPACITY_BYTES: usize = 64 * 1024;

/// Default number of records after which a group-commit batch closes.
pub const DEFAULT_GROUP_COMMIT_MAX_RECORDS: usize = 64;

/// Where and how the write-ahead log is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceOptions {
    /// Path of the log file. Missing parent directories are created.
    pub wal_path: PathBuf,
    pub buffer_capacity_bytes: usize,
    pub group_commit: bool,
    pub group_commit_max_records: usize,
}

impl PersistenceOptions {
    pub fn new(wal_path: impl Into<PathBuf>) -> Self {
        PersistenceOptions {
            wal_path: wal_path.into(),
            buffer_capacity_bytes: DEFAULT_BUFFER_CAPACITY_BYTES,
            group_commit: true,
            group_commit_max_records: DEFAULT_GROUP_COMMIT_MAX_RECORDS,
        }
    }

    pub fn buffer_capacity_bytes(mut self, bytes: usize) -> Self {
        self.buffer_capacity_bytes = bytes;
        self
    }

    pub fn group_commit(mut self, enabled: bool) -> Self {
        self.group_commit = enabled;
        self
    }

    pub fn group_commit_max_records(mut self, records: usize) -> Self {
        self.group_commit_max_records = records;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.wal_path.as_os_str().is_empty() {
            return Err(FluxError::Configuration("wal_path must not be empty".into()));
        }
        if self.buffer_capacity_bytes == 0 {
            return Err(FluxError::Configuration(
                "buffer_capacity_bytes must be greater than zero".into(),
            ));
        }
        if self.group_commit_max_records == 0 {
            return Err(FluxError::Configuration(
                "group_commit_max_records must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Defines the durability guarantees for the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// **In-Memory Mode:** nothing is written to disk and all data is lost on
    /// process exit.
    #[default]
    InMemory,
    /// **Relaxed Durability:** a commit is acknowledged once its records are
    /// in the log buffer. The background syncer writes and `fsync`s the log
    /// every `flush_interval_ms`.
    ///
    /// An OS crash or power failure can lose the commits since the last flush.
    Relaxed {
        options: PersistenceOptions,
        flush_interval_ms: u64,
    },
    /// **Full Durability:** a commit is acknowledged only after its records
    /// are synced to disk. Concurrent commits share one `fsync` when group
    /// commit is enabled.
    Full { options: PersistenceOptions },
}

impl DurabilityLevel {
    pub fn options(&self) -> Option<&PersistenceOptions> {
        match self {
            DurabilityLevel::InMemory => None,
            DurabilityLevel::Relaxed { options, .. } | DurabilityLevel::Full { options } => Some(options),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            DurabilityLevel::InMemory => Ok(()),
            DurabilityLevel::Relaxed {
                options,
                flush_interval_ms,
            } => {
                if *flush_interval_ms == 0 {
                    return Err(FluxError::Configuration(
                        "flush_interval_ms must be greater than zero".into(),
                    ));
                }
                options.validate()
            }
            DurabilityLevel::Full { options } => options.validate(),
        }
    }
}

/// What opening the log found in an existing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub records: u64,
    pub last_sequence: u64,
    pub max_txn_id: TxId,
    pub valid_bytes: u64,
    pub truncated_bytes: u64,
}

/// Counters reported by [`PersistenceEngine::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalStats {
    pub bytes_written: u64,
    pub syncs: u64,
    pub last_sequence: u64,
    pub synced_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Full,
    Relaxed,
}

struct WalState {
    file: File,
    buffer: Vec<u8>,
    next_sequence: u64,
    /// Last sequence copied into `buffer`.
    buffered_through: u64,
    /// Last sequence handed to the operating system.
    written_through: u64,
    /// Last sequence covered by a durability barrier.
    synced_through: u64,
    /// Records appended since the last barrier.
    unsynced_records: usize,
    /// Length of the file as far as this process has written it.
    file_len: u64,
    bytes_written: u64,
    syncs: u64,
}

impl WalState {
    /// Writes the buffer to the file. On failure the file is cut back to its
    /// previous length and the buffer is kept for a retry.
    fn write_out(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.buffer) {
            error!(error = %e, "WAL write failed; rolling file back to last good length");
            let _ = self
                .file
                .set_len(self.file_len)
                .and_then(|_| self.file.seek(SeekFrom::Start(self.file_len)));
            return Err(e);
        }
        let written = self.buffer.len() as u64;
        self.file_len += written;
        self.bytes_written += written;
        self.buffer.clear();
        self.written_through = self.buffered_through;
        metrics::counter!(m::WAL_BYTES_WRITTEN_TOTAL).increment(written);
        Ok(())
    }

    fn barrier(&mut self) -> io::Result<()> {
        let started = Instant::now();
        self.file.sync_data()?;
        self.synced_through = self.written_through;
        self.unsynced_records = 0;
        self.syncs += 1;
        metrics::histogram!(m::WAL_SYNC_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// `true` if everything appended is already covered by a barrier.
    fn is_synced(&self) -> bool {
        self.buffer.is_empty() && self.written_through == self.synced_through
    }

    fn flush(&mut self, barrier: bool) -> io::Result<()> {
        self.write_out()?;
        if barrier {
            self.barrier()?;
        }
        metrics::counter!(m::WAL_FLUSHES_TOTAL, m::LABEL_BARRIER => if barrier { "true" } else { "false" })
            .increment(1);
        Ok(())
    }
}

struct SyncRequest {
    reply: Sender<Result<()>>,
}

/// The engine responsible for the write-ahead log.
pub struct PersistenceEngine {
    mode: SyncMode,
    options: PersistenceOptions,
    state: Arc<Mutex<WalState>>,
    requests: Option<Sender<SyncRequest>>,
    syncer: Option<JoinHandle<()>>,
    recovered: RecoverySummary,
}

impl PersistenceEngine {
    /// Opens (or creates) the log described by `level`.
    ///
    /// If the level is `InMemory`, it returns `Ok(None)`. An existing log is
    /// scanned and its invalid tail, if any, is truncated.
    pub fn open(level: &DurabilityLevel) -> Result<Option<Self>> {
        level.validate()?;
        let (mode, options, flush_interval) = match level {
            DurabilityLevel::InMemory => return Ok(None),
            DurabilityLevel::Relaxed {
                options,
                flush_interval_ms,
            } => (
                SyncMode::Relaxed,
                options.clone(),
                Some(Duration::from_millis(*flush_interval_ms)),
            ),
            DurabilityLevel::Full { options } => (SyncMode::Full, options.clone(), None),
        };

        if let Some(parent) = options.wal_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&options.wal_path)?;

        let recovered = Self::repair_tail(&options, &mut file)?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve(options.buffer_capacity_bytes)
            .map_err(|_| FluxError::OutOfMemory(options.buffer_capacity_bytes))?;

        let state = Arc::new(Mutex::new(WalState {
            file,
            buffer,
            next_sequence: recovered.last_sequence + 1,
            buffered_through: recovered.last_sequence,
            written_through: recovered.last_sequence,
            synced_through: recovered.last_sequence,
            unsynced_records: 0,
            file_len: recovered.valid_bytes,
            bytes_written: 0,
            syncs: 0,
        }));

        let (tx, rx) = crossbeam_channel::unbounded();
        let syncer_state = Arc::clone(&state);
        let syncer = std::thread::Builder::new()
            .name("wal-syncer".into())
            .spawn(move || run_syncer(syncer_state, rx, mode, flush_interval))?;

        info!(
            path = %options.wal_path.display(),
            records = recovered.records,
            next_sequence = recovered.last_sequence + 1,
            "write-ahead log opened"
        );

        Ok(Some(PersistenceEngine {
            mode,
            options,
            state,
            requests: Some(tx),
            syncer: Some(syncer),
            recovered,
        }))
    }

    fn repair_tail(options: &PersistenceOptions, file: &mut File) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        let mut scan = RecoveryIterator::open(&options.wal_path)?;
        for record in &mut scan {
            let record = record?;
            summary.records += 1;
            summary.last_sequence = record.sequence;
            summary.max_txn_id = summary.max_txn_id.max(record.txn_id);
        }
        summary.valid_bytes = scan.valid_offset();

        let len = file.metadata()?.len();
        if len > summary.valid_bytes {
            summary.truncated_bytes = len - summary.valid_bytes;
            warn!(
                path = %options.wal_path.display(),
                valid_bytes = summary.valid_bytes,
                truncated_bytes = summary.truncated_bytes,
                "truncating invalid WAL tail"
            );
            file.set_len(summary.valid_bytes)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(summary.valid_bytes))?;
        Ok(summary)
    }

    pub fn options(&self) -> &PersistenceOptions {
        &self.options
    }

    /// What was found in the log when it was opened.
    pub fn recovered(&self) -> RecoverySummary {
        self.recovered
    }

    /// `true` if commits must wait for their records to be synced.
    pub fn commit_waits_for_sync(&self) -> bool {
        self.mode == SyncMode::Full
    }

    /// Appends `record`, assigning it the next sequence number. The record's
    /// own `sequence` field is ignored.
    pub fn append(&self, record: &WalRecord) -> Result<u64> {
        self.append_parts(record.txn_id, record.record_type, record.table_id, &record.key, &record.value)
    }

    /// Appends one record to the default table and returns its sequence number.
    pub fn append_entry(&self, txn_id: TxId, record_type: RecordType, key: &[u8], value: &[u8]) -> Result<u64> {
        self.append_parts(txn_id, record_type, DEFAULT_TABLE_ID, key, value)
    }

    fn append_parts(&self, txn_id: TxId, record_type: RecordType, table_id: u32, key: &[u8], value: &[u8]) -> Result<u64> {
        if u32::try_from(key.len()).is_err() || u32::try_from(value.len()).is_err() {
            return Err(FluxError::InvalidArgument("record field exceeds u32::MAX bytes"));
        }
        let needed = HEADER_LEN + key.len() + value.len();

        let mut state = self.state.lock();
        if !state.buffer.is_empty() && state.buffer.len() + needed > self.options.buffer_capacity_bytes {
            state.write_out()?;
        }
        state
            .buffer
            .try_reserve(needed)
            .map_err(|_| FluxError::OutOfMemory(needed))?;

        let sequence = state.next_sequence;
        record::encode_parts(&mut state.buffer, txn_id, record_type, table_id, sequence, key, value);
        state.next_sequence += 1;
        state.buffered_through = sequence;
        state.unsynced_records += 1;

        let barrier = self.mode == SyncMode::Full;
        if !self.options.group_commit {
            state.flush(barrier)?;
        } else if state.unsynced_records >= self.options.group_commit_max_records {
            debug!(records = state.unsynced_records, "group commit batch full");
            state.flush(barrier)?;
        }
        Ok(sequence)
    }

    /// Flushes everything appended so far; issues a barrier in `Full` mode.
    pub fn sync(&self) -> Result<()> {
        self.request_sync(None)
    }

    /// Like [`sync`](Self::sync), but gives up after `timeout`.
    ///
    /// A timed-out sync leaves the buffer as it was; the syncer finishes the
    /// flush on its own and a later sync can be retried.
    pub fn sync_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.request_sync(Some(timeout))
    }

    /// Makes sure the record with `sequence` is durable, joining the current
    /// group-commit batch if it is not.
    pub fn sync_through(&self, sequence: u64, timeout: Option<Duration>) -> Result<()> {
        {
            let state = self.state.lock();
            let covered = match self.mode {
                SyncMode::Full => state.synced_through,
                SyncMode::Relaxed => state.written_through,
            };
            if covered >= sequence {
                return Ok(());
            }
        }
        self.request_sync(timeout)
    }

    fn request_sync(&self, timeout: Option<Duration>) -> Result<()> {
        let Some(requests) = &self.requests else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "WAL syncer is shut down").into());
        };
        let (reply, outcome) = crossbeam_channel::bounded(1);
        if requests.send(SyncRequest { reply }).is_err() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "WAL syncer is gone").into());
        }
        match timeout {
            Some(timeout) => outcome.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => FluxError::Timeout(timeout),
                RecvTimeoutError::Disconnected => syncer_gone(),
            })?,
            None => outcome.recv().map_err(|_| syncer_gone())?,
        }
    }

    /// Reads the log from the beginning. Only meaningful before new appends.
    pub fn recovery_iterator(&self) -> Result<RecoveryIterator> {
        RecoveryIterator::open(&self.options.wal_path)
    }

    pub fn stats(&self) -> WalStats {
        let state = self.state.lock();
        WalStats {
            bytes_written: state.bytes_written,
            syncs: state.syncs,
            last_sequence: state.next_sequence - 1,
            synced_sequence: state.synced_through,
        }
    }
}

fn syncer_gone() -> FluxError {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL syncer stopped before replying").into()
}

fn run_syncer(
    state: Arc<Mutex<WalState>>,
    requests: Receiver<SyncRequest>,
    mode: SyncMode,
    flush_interval: Option<Duration>,
) {
    let barrier_on_request = mode == SyncMode::Full;
    loop {
        let first = match flush_interval {
            Some(interval) => match requests.recv_timeout(interval) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = state.lock();
                    if !state.is_synced() {
                        if let Err(e) = state.flush(true) {
                            error!(error = %e, "background WAL flush failed");
                        }
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        let mut batch = vec![first];
        batch.extend(requests.try_iter());
        let outcome = state.lock().flush(barrier_on_request).map_err(FluxError::from);
        if let Err(e) = &outcome {
            error!(error = %e, waiters = batch.len(), "WAL sync failed");
        }
        metrics::histogram!(m::WAL_GROUP_COMMIT_BATCH_SIZE).record(batch.len() as f64);
        for request in batch {
            // A waiter that timed out has dropped its receiver.
            let _ = request.reply.send(outcome.clone());
        }
    }

    let mut state = state.lock();
    if !state.is_synced() {
        if let Err(e) = state.flush(true) {
            error!(error = %e, "final WAL flush failed");
        }
    }
    debug!("WAL syncer stopped");
}

impl Drop for PersistenceEngine {
    fn drop(&mut self) {
        // Closing the channel makes the syncer flush once more and exit.
        drop(self.requests.take());
        if let Some(handle) = self.syncer.take() {
            if handle.join().is_err() {
                error!("WAL syncer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(dir: &tempfile::TempDir, options: impl FnOnce(PersistenceOptions) -> PersistenceOptions) -> PersistenceEngine {
        let options = options(PersistenceOptions::new(dir.path().join("wal").join("fluxkv.wal")));
        PersistenceEngine::open(&DurabilityLevel::Full { options })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn in_memory_has_no_log() {
        assert!(PersistenceEngine::open(&DurabilityLevel::InMemory).unwrap().is_none());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = PersistenceOptions::new("wal.log").buffer_capacity_bytes(0);
        assert!(matches!(
            PersistenceEngine::open(&DurabilityLevel::Full { options }),
            Err(FluxError::Configuration(_))
        ));
        let relaxed = DurabilityLevel::Relaxed {
            options: PersistenceOptions::new("wal.log"),
            flush_interval_ms: 0,
        };
        assert!(matches!(relaxed.validate(), Err(FluxError::Configuration(_))));
    }

    #[test]
    fn sequences_start_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let wal = full(&dir, |o| o);
        assert_eq!(wal.append_entry(1, RecordType::Put, b"a", b"1").unwrap(), 1);
        assert_eq!(wal.append_entry(1, RecordType::Commit, b"", b"").unwrap(), 2);
        wal.sync().unwrap();
        assert_eq!(wal.stats().synced_sequence, 2);
    }

    #[test]
    fn batch_closes_at_the_record_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let wal = full(&dir, |o| o.group_commit_max_records(3));
        wal.append_entry(1, RecordType::Put, b"a", b"1").unwrap();
        wal.append_entry(1, RecordType::Put, b"b", b"2").unwrap();
        assert_eq!(wal.stats().synced_sequence, 0);
        wal.append_entry(1, RecordType::Commit, b"", b"").unwrap();
        assert_eq!(wal.stats().synced_sequence, 3);
        assert_eq!(wal.stats().syncs, 1);
    }

    #[test]
    fn without_group_commit_every_append_is_synced() {
        let dir = tempfile::tempdir().unwrap();
        let wal = full(&dir, |o| o.group_commit(false));
        let seq = wal.append_entry(1, RecordType::Put, b"a", b"1").unwrap();
        assert_eq!(wal.stats().synced_sequence, seq);
        // Already durable, so no extra round trip is needed.
        wal.sync_through(seq, Some(Duration::from_millis(1))).unwrap();
    }

    #[test]
    fn full_buffer_is_written_out_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let wal = full(&dir, |o| o.buffer_capacity_bytes(64));
        wal.append_entry(1, RecordType::Put, b"a", &[0u8; 20]).unwrap();
        assert_eq!(wal.stats().bytes_written, 0);
        wal.append_entry(1, RecordType::Put, b"b", &[0u8; 20]).unwrap();
        assert_eq!(wal.stats().bytes_written, (HEADER_LEN + 21) as u64);
    }

    #[test]
    fn sync_timeout_leaves_the_buffer_intact() {
        let dir = tempfile::tempdir().unwrap();
        let wal = full(&dir, |o| o);
        wal.append_entry(1, RecordType::Put, b"a", b"1").unwrap();

        let held = wal.state.lock();
        let outcome = wal.sync_with_timeout(Duration::from_millis(20));
        assert!(matches!(outcome, Err(FluxError::Timeout(_))));
        assert_eq!(held.buffered_through, 1);
        assert_eq!(held.synced_through, 0);
        assert!(!held.buffer.is_empty());
        drop(held);

        wal.sync().unwrap();
        assert_eq!(wal.stats().synced_sequence, 1);
    }

    #[test]
    fn reopening_continues_the_sequence_and_repairs_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal").join("fluxkv.wal");
        {
            let wal = full(&dir, |o| o);
            wal.append_entry(7, RecordType::Put, b"a", b"1").unwrap();
            wal.append_entry(7, RecordType::Commit, b"", b"").unwrap();
            wal.sync().unwrap();
        }
        let valid = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[0xAB; 10])
            .unwrap();

        let wal = full(&dir, |o| o);
        let recovered = wal.recovered();
        assert_eq!(recovered.records, 2);
        assert_eq!(recovered.max_txn_id, 7);
        assert_eq!(recovered.truncated_bytes, 10);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid);
        assert_eq!(wal.append_entry(8, RecordType::Put, b"b", b"2").unwrap(), 3);
    }

    #[test]
    fn relaxed_sync_writes_without_a_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let options = PersistenceOptions::new(dir.path().join("relaxed.wal"));
        let wal = PersistenceEngine::open(&DurabilityLevel::Relaxed {
            options,
            flush_interval_ms: 60_000,
        })
        .unwrap()
        .unwrap();
        assert!(!wal.commit_waits_for_sync());
        wal.append_entry(1, RecordType::Put, b"a", b"1").unwrap();
        wal.sync().unwrap();
        let stats = wal.stats();
        assert_eq!(stats.bytes_written, (HEADER_LEN + 2) as u64);
        assert_eq!(stats.syncs, 0);
    }

    #[test]
    fn idle_relaxed_log_is_not_synced_again() {
        let dir = tempfile::tempdir().unwrap();
        let options = PersistenceOptions::new(dir.path().join("idle.wal"));
        let wal = PersistenceEngine::open(&DurabilityLevel::Relaxed {
            options,
            flush_interval_ms: 5,
        })
        .unwrap()
        .unwrap();
        wal.append_entry(1, RecordType::Put, b"a", b"1").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while wal.stats().synced_sequence < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(wal.stats().synced_sequence, 1);
        let syncs = wal.stats().syncs;

        // Many intervals pass with nothing new to flush.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(wal.stats().syncs, syncs);
    }
}
