//! The engine context: one object owning the index, the version store, the
//! transaction manager, and the write-ahead log.
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```
//! # use fluxkv::db::Engine;
//! # use fluxkv::IsolationLevel;
//! #
//! # fn main() -> Result<(), fluxkv::Error> {
//! let engine = Engine::new_in_memory()?;
//!
//! let txn = engine.begin(IsolationLevel::RepeatableRead);
//! engine.put(&txn, b"key1", b"value1")?;
//! engine.commit(&txn)?;
//!
//! let reader = engine.begin(IsolationLevel::RepeatableRead);
//! assert_eq!(engine.get(&reader, b"key1")?, b"value1");
//! # Ok(())
//! # }
//! ```
//!
//! ## Explicit Transactions
//!
//! For multi-statement units of work, use the [`Engine::transaction`] helper.
//! It commits when the closure returns `Ok` and rolls back otherwise.
//!
//! ```
//! # use fluxkv::db::Engine;
//! # use fluxkv::IsolationLevel;
//! #
//! # fn main() -> Result<(), fluxkv::Error> {
//! # let engine = Engine::new_in_memory()?;
//! let balance = |bytes: &[u8]| u64::from_le_bytes(bytes.try_into().unwrap());
//!
//! engine.transaction(IsolationLevel::Serializable, |txn| {
//!     engine.put(txn, b"alice", &100u64.to_le_bytes())?;
//!     engine.put(txn, b"bob", &50u64.to_le_bytes())
//! })?;
//!
//! // Atomically transfer 20 from Alice to Bob.
//! engine.transaction(IsolationLevel::Serializable, |txn| {
//!     let alice = balance(engine.get(txn, b"alice")?.as_bytes());
//!     let bob = balance(engine.get(txn, b"bob")?.as_bytes());
//!     engine.put(txn, b"alice", &(alice - 20).to_le_bytes())?;
//!     engine.put(txn, b"bob", &(bob + 20).to_le_bytes())
//! })?;
//!
//! let txn = engine.begin_default();
//! assert_eq!(balance(engine.get(&txn, b"alice")?.as_bytes()), 80);
//! assert_eq!(balance(engine.get(&txn, b"bob")?.as_bytes()), 70);
//! # Ok(())
//! # }
//! ```

use crate::error::{FluxError, Result};
use crate::metrics as m;
use crate::persistence::{DurabilityLevel, PersistenceEngine, PersistenceOptions, RecordType, RecoveryIterator};
use crate::transaction::{IsolationLevel, Timestamp, Transaction, TransactionManager, TxId};
use crate::vacuum::{GcStats, VacuumOptions};
use crate::value::{validate_key, Key, Value};
use crate::version::VersionStore;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Every setting an [`Engine`] is opened with.
///
/// The struct is plain data so it can be loaded from an embedder's own config
/// files; [`EngineBuilder`] produces the same thing in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub durability: DurabilityLevel,
    pub default_isolation: IsolationLevel,
    /// Upper bound on how long a commit waits for its WAL sync.
    pub sync_timeout: Option<Duration>,
    /// Runs vacuum in the background when set.
    pub vacuum: Option<VacuumOptions>,
    /// Maximum tower height of the ordered index, `1..=32`.
    pub max_level: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            durability: DurabilityLevel::InMemory,
            default_isolation: IsolationLevel::default(),
            sync_timeout: None,
            vacuum: None,
            max_level: crate::MAX_LEVEL,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.durability.validate()?;
        if !(1..=crate::MAX_LEVEL).contains(&self.max_level) {
            return Err(FluxError::Configuration(format!(
                "max_level must be between 1 and {}, got {}",
                crate::MAX_LEVEL,
                self.max_level
            )));
        }
        if self.sync_timeout == Some(Duration::ZERO) {
            return Err(FluxError::Configuration("sync_timeout must be greater than zero".into()));
        }
        if let Some(vacuum) = &self.vacuum {
            if vacuum.interval.is_zero() {
                return Err(FluxError::Configuration("vacuum interval must be greater than zero".into()));
            }
        }
        Ok(())
    }
}

/// A builder for creating an [`Engine`] with custom configurations.
///
/// # Examples
/// ```
/// # use fluxkv::db::Engine;
/// # use fluxkv::{PersistenceOptions, VacuumOptions};
/// # use std::time::Duration;
/// # use tempfile::tempdir;
/// #
/// # let temp_dir = tempdir().unwrap();
/// # let wal_path = temp_dir.path().join("fluxkv.wal");
/// // A durable engine with custom WAL settings and auto-vacuuming enabled.
/// let engine = Engine::builder()
///     .durability_full(PersistenceOptions::new(wal_path).group_commit_max_records(128))
///     .sync_timeout(Duration::from_secs(5))
///     .auto_vacuum(VacuumOptions {
///         interval: Duration::from_secs(30),
///     })
///     .build()
///     .unwrap();
/// # drop(engine);
/// ```
#[derive(Debug, Default)]
pub struct EngineBuilder {
    persistence_options: Option<PersistenceOptions>,
    is_full_durability: bool,
    flush_interval: Option<Duration>,
    sync_timeout: Option<Duration>,
    default_isolation: IsolationLevel,
    vacuum: Option<VacuumOptions>,
    max_level: Option<usize>,
}

impl EngineBuilder {
    /// Configures the engine for full durability (commits wait for `fsync`).
    pub fn durability_full(mut self, options: PersistenceOptions) -> Self {
        self.persistence_options = Some(options);
        self.is_full_durability = true;
        self
    }

    /// Configures the engine for relaxed durability.
    ///
    /// You must chain this with [`flush_interval`](Self::flush_interval).
    pub fn durability_relaxed(mut self, options: PersistenceOptions) -> Self {
        self.persistence_options = Some(options);
        self.is_full_durability = false;
        self
    }

    /// Sets the background flush interval for relaxed durability.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Bounds how long a commit waits for its WAL sync.
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// Isolation level used by [`Engine::begin_default`].
    pub fn default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Enables and configures automatic vacuuming.
    ///
    /// If not set, vacuuming must be performed manually by calling [`Engine::vacuum`].
    pub fn auto_vacuum(mut self, vacuum: VacuumOptions) -> Self {
        self.vacuum = Some(vacuum);
        self
    }

    /// Caps the tower height of the ordered index.
    pub fn max_level(mut self, max_level: usize) -> Self {
        self.max_level = Some(max_level);
        self
    }

    /// The configuration this builder describes.
    pub fn config(&self) -> Result<EngineConfig> {
        let durability = match &self.persistence_options {
            Some(options) if self.is_full_durability => DurabilityLevel::Full {
                options: options.clone(),
            },
            Some(options) => {
                let Some(interval) = self.flush_interval else {
                    return Err(FluxError::Configuration(
                        "relaxed durability requires a flush interval".into(),
                    ));
                };
                DurabilityLevel::Relaxed {
                    options: options.clone(),
                    flush_interval_ms: interval.as_millis() as u64,
                }
            }
            None => DurabilityLevel::InMemory,
        };
        Ok(EngineConfig {
            durability,
            default_isolation: self.default_isolation,
            sync_timeout: self.sync_timeout,
            vacuum: self.vacuum,
            max_level: self.max_level.unwrap_or(crate::MAX_LEVEL),
        })
    }

    /// Builds the `Engine`, recovering any existing log.
    pub fn build(self) -> Result<Engine> {
        Engine::open(self.config()?)
    }
}

/// Counters describing the engine at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub conflicts: u64,
    pub active_transactions: usize,
    pub keys: usize,
    pub memory_bytes: u64,
    pub versions_reclaimed: u64,
    pub wal_bytes_written: u64,
    pub wal_syncs: u64,
}

/// What replaying a log produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveredState {
    /// Largest transaction id found in the log.
    pub last_txn_id: TxId,
    /// Last commit timestamp assigned during replay.
    pub last_timestamp: Timestamp,
    pub transactions_applied: u64,
    pub transactions_discarded: u64,
    pub records_replayed: u64,
}

/// Replays the committed transactions in `records` into `store`, in log order.
///
/// The first pass collects transactions that were explicitly aborted; the
/// second applies every other transaction when its COMMIT record is reached.
/// Each applied transaction gets the next timestamp from 1 on, so replaying
/// the same log into an empty store always yields the same state.
pub fn replay(records: &mut RecoveryIterator, store: &VersionStore) -> Result<RecoveredState> {
    let mut state = RecoveredState::default();
    let mut aborted = HashSet::new();
    for record in records.by_ref() {
        let record = record?;
        state.last_txn_id = state.last_txn_id.max(record.txn_id);
        if record.record_type == RecordType::Abort {
            aborted.insert(record.txn_id);
        }
    }

    records.rewind()?;
    let mut pending: HashMap<TxId, Vec<(RecordType, Vec<u8>, Vec<u8>)>> = HashMap::new();
    for record in records {
        let record = record?;
        if aborted.contains(&record.txn_id) {
            continue;
        }
        match record.record_type {
            RecordType::Put | RecordType::Delete => pending
                .entry(record.txn_id)
                .or_default()
                .push((record.record_type, record.key, record.value)),
            RecordType::Commit => {
                let ops = pending.remove(&record.txn_id).unwrap_or_default();
                state.last_timestamp += 1;
                let ts = state.last_timestamp;
                for (record_type, key, value) in &ops {
                    match record_type {
                        RecordType::Put => store.put(key, record.txn_id, ts, Value::new(value)?)?,
                        _ => store.delete(key, record.txn_id, ts)?,
                    }
                }
                state.records_replayed += ops.len() as u64;
                state.transactions_applied += 1;
            }
            RecordType::Abort => {}
        }
    }
    state.transactions_discarded = (pending.len() + aborted.len()) as u64;
    metrics::counter!(m::RECOVERY_RECORDS_REPLAYED_TOTAL).increment(state.records_replayed);
    Ok(state)
}

struct VacuumWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl VacuumWorker {
    fn spawn(manager: Arc<TransactionManager>, options: VacuumOptions) -> Result<Self> {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("fluxkv-vacuum".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "could not start vacuum runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let mut ticker = tokio::time::interval(options.interval);
                    // The first tick fires immediately.
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = &mut stop => break,
                            _ = ticker.tick() => {
                                let stats = manager.vacuum();
                                if stats.versions_removed > 0 || stats.keys_removed > 0 {
                                    debug!(
                                        versions_removed = stats.versions_removed,
                                        keys_removed = stats.keys_removed,
                                        "automatic vacuum reclaimed versions"
                                    );
                                }
                            }
                        }
                    }
                });
            })?;
        Ok(VacuumWorker {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }
}

impl Drop for VacuumWorker {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("automatic vacuum thread panicked");
            }
        }
    }
}

/// The central engine object.
///
/// An `Engine` is thread-safe and can be shared across threads, typically by
/// wrapping it in an `Arc`. Transactions it hands out may be used from any
/// thread, one at a time.
///
/// Use [`Engine::builder()`] or [`Engine::open`] to construct one.
pub struct Engine {
    config: EngineConfig,
    manager: Arc<TransactionManager>,
    wal: Option<Arc<PersistenceEngine>>,
    recovered: RecoveredState,
    _vacuum: Option<VacuumWorker>,
}

impl Engine {
    /// Creates a new `EngineBuilder` to configure and build an `Engine`.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Creates a new, empty, in-memory `Engine` with default settings.
    pub fn new_in_memory() -> Result<Self> {
        Engine::open(EngineConfig::default())
    }

    /// Opens an engine, replaying the WAL first if `config` names one.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let wal = PersistenceEngine::open(&config.durability)?.map(Arc::new);
        let store = Arc::new(VersionStore::with_max_level(config.max_level));

        let recovered = match &wal {
            Some(wal) => {
                let mut records = wal.recovery_iterator()?;
                let state = replay(&mut records, &store)?;
                info!(
                    transactions = state.transactions_applied,
                    discarded = state.transactions_discarded,
                    records = state.records_replayed,
                    "recovered from write-ahead log"
                );
                state
            }
            None => RecoveredState::default(),
        };

        let manager = Arc::new(
            TransactionManager::new(Arc::clone(&store), wal.clone())
                .with_sync_timeout(config.sync_timeout)
                .resume_from(recovered.last_txn_id, recovered.last_timestamp),
        );
        let vacuum = match config.vacuum {
            Some(options) => Some(VacuumWorker::spawn(Arc::clone(&manager), options)?),
            None => None,
        };

        Ok(Engine {
            config,
            manager,
            wal,
            recovered,
            _vacuum: vacuum,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// What startup recovery replayed.
    pub fn recovered(&self) -> RecoveredState {
        self.recovered
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        self.manager.store()
    }

    /// Begins a transaction at `isolation`.
    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        self.manager.begin(isolation)
    }

    /// Begins a transaction at the configured default isolation level.
    pub fn begin_default(&self) -> Transaction {
        self.manager.begin(self.config.default_isolation)
    }

    /// Reads `key`. Returns [`FluxError::NotFound`] if no visible version holds a value.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Value> {
        self.manager.read(txn, key)
    }

    /// Writes `value` under `key` in `txn`'s write set.
    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.manager.write(txn, key, Some(Value::new(value)?))
    }

    /// Deletes `key` in `txn`'s write set.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.manager.write(txn, key, None)
    }

    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        self.manager.commit(txn)
    }

    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        self.manager.rollback(txn)
    }

    /// Runs `f` in a new transaction, committing on `Ok` and rolling back on `Err`.
    pub fn transaction<T, F>(&self, isolation: IsolationLevel, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let txn = self.begin(isolation);
        match f(&txn) {
            Ok(value) => {
                // On failure `txn` is still active and rolls back on drop.
                self.commit(&txn)?;
                Ok(value)
            }
            Err(e) => {
                self.rollback(&txn)?;
                Err(e)
            }
        }
    }

    /// Returns the visible pairs with `start <= key <= end` in key order,
    /// including `txn`'s own uncommitted writes.
    pub fn range(&self, txn: &Transaction, start: &[u8], end: &[u8]) -> Result<Vec<(Key, Value)>> {
        metrics::counter!(m::OPERATIONS_TOTAL, m::LABEL_OPERATION_TYPE => "range_scan").increment(1);
        if start > end {
            return Ok(Vec::new());
        }
        self.collect(txn, start, Some(end), |_| true)
    }

    /// Returns the visible pairs whose key starts with `prefix` in key order,
    /// including `txn`'s own uncommitted writes.
    pub fn prefix_scan(&self, txn: &Transaction, prefix: &[u8]) -> Result<Vec<(Key, Value)>> {
        metrics::counter!(m::OPERATIONS_TOTAL, m::LABEL_OPERATION_TYPE => "prefix_scan").increment(1);
        self.collect(txn, prefix, None, |key| key.starts_with(prefix))
    }

    fn collect<P>(&self, txn: &Transaction, start: &[u8], end: Option<&[u8]>, in_scope: P) -> Result<Vec<(Key, Value)>>
    where
        P: Fn(&[u8]) -> bool,
    {
        txn.ensure_active()?;
        let snapshot = txn.snapshot();

        let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
        self.store()
            .scan(start, end, &snapshot, self.manager.statuses(), |key, value| {
                if !in_scope(key) {
                    return false;
                }
                merged.insert(Box::from(key), value);
                true
            });

        // Own writes win over committed versions.
        for (key, value) in txn.pending_range(start, end) {
            if !in_scope(&key[..]) {
                continue;
            }
            match value {
                Some(value) => {
                    merged.insert(key, value);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }

        for key in merged.keys() {
            txn.track_read(key)?;
        }
        Ok(merged.into_iter().collect())
    }

    /// Returns a stream that yields the pairs of [`range`](Self::range).
    ///
    /// **Note:** the results are gathered up front so they can be merged with
    /// the transaction's own writes; the stream then hands them out one by one.
    pub fn range_stream<'a>(
        &'a self,
        txn: &'a Transaction,
        start: &'a [u8],
        end: &'a [u8],
    ) -> impl Stream<Item = Result<(Key, Value)>> + 'a {
        async_stream::stream! {
            match self.range(txn, start, end) {
                Ok(pairs) => {
                    for pair in pairs {
                        yield Ok(pair);
                    }
                }
                Err(e) => yield Err(e),
            }
        }
    }

    /// Runs one vacuum pass now.
    pub fn vacuum(&self) -> GcStats {
        self.manager.vacuum()
    }

    /// The oldest start timestamp among active transactions.
    pub fn watermark(&self) -> Timestamp {
        self.manager.watermark()
    }

    /// Flushes the WAL; a no-op for in-memory engines.
    pub fn sync(&self) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.sync(),
            None => Ok(()),
        }
    }

    /// Like [`sync`](Self::sync), but fails with [`FluxError::Timeout`] after `timeout`.
    pub fn sync_timeout(&self, timeout: Duration) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.sync_with_timeout(timeout),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let counts = self.manager.counts();
        let wal = self.wal.as_ref().map(|wal| wal.stats()).unwrap_or_default();
        let store = self.store();
        EngineStats {
            transactions_begun: counts.begun,
            transactions_committed: counts.committed,
            transactions_aborted: counts.aborted,
            conflicts: counts.conflicts,
            active_transactions: self.manager.active_count(),
            keys: store.key_count(),
            memory_bytes: store.memory_bytes(),
            versions_reclaimed: store.versions_reclaimed(),
            wal_bytes_written: wal.bytes_written,
            wal_syncs: wal.syncs,
        }
    }
}
