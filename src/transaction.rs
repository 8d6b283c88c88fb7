//! Manages transactions, snapshots, and the commit protocol.
//!
//! # Core Components
//!
//! -   **`TransactionManager`**: hands out transaction ids and timestamps,
//!     keeps the registry of active transactions (whose oldest start timestamp
//!     is the garbage-collection watermark), and runs commit and rollback.
//!
//! -   **`Transaction`**: one unit of work. Writes are buffered in a private
//!     write set and only reach the version store when the transaction
//!     commits; reads consult the write set first.
//!
//! -   **`Snapshot`**: the `(txid, start_ts, isolation)` triple that decides
//!     which versions a transaction may observe.
//!
//! # Commit protocol
//!
//! 1.  Under the commit lock: validate against concurrent writers (for
//!     REPEATABLE_READ and SERIALIZABLE), append the write set and a COMMIT
//!     record to the WAL, and take a publish ticket. Tickets follow log order.
//! 2.  Outside any lock: wait for the WAL to make the records durable. Commits
//!     that wait at the same time share one `fsync`.
//! 3.  In ticket order, under the registry lock: draw the commit timestamp,
//!     publish every version stamped with it, and retire the transaction.
//!
//! Because begin also draws its start timestamp under the registry lock, a
//! transaction either starts before a commit's timestamp exists or after all
//! of that commit's versions are published.

use crate::error::{FluxError, Result};
use crate::metrics as m;
use crate::persistence::{PersistenceEngine, RecordType};
use crate::value::{make_key, validate_key, Key, Value};
use crate::version::{Lookup, Version, VersionStore};
use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

// --- Core MVCC Types ---

/// A unique identifier for a transaction.
pub type TxId = u64;

/// A point on the engine's logical clock.
pub type Timestamp = u64;

/// The consistency contract a transaction runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

/// The status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// The transaction is currently in progress.
    Active,
    /// The transaction has successfully committed.
    Committed,
    /// The transaction has been rolled back and its changes were discarded.
    Aborted,
}

impl TransactionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransactionStatus::Active,
            1 => TransactionStatus::Committed,
            _ => TransactionStatus::Aborted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransactionStatus::Active => 0,
            TransactionStatus::Committed => 1,
            TransactionStatus::Aborted => 2,
        }
    }
}

/// Final status of recent transactions, consulted by READ_COMMITTED readers.
///
/// Entries older than the oldest active transaction are pruned by vacuum; a
/// missing entry therefore means the writer finished long ago, and since only
/// committing transactions publish versions, it is treated as committed.
#[derive(Debug, Default)]
pub struct StatusTable {
    statuses: DashMap<TxId, TransactionStatus>,
}

impl StatusTable {
    pub fn get(&self, txid: TxId) -> Option<TransactionStatus> {
        self.statuses.get(&txid).map(|s| *s)
    }

    pub fn is_committed(&self, txid: TxId) -> bool {
        self.get(txid).map_or(true, |s| s == TransactionStatus::Committed)
    }

    pub(crate) fn set(&self, txid: TxId, status: TransactionStatus) {
        self.statuses.insert(txid, status);
    }

    /// Drops every entry for a transaction id below `min_txid`.
    pub(crate) fn prune_below(&self, min_txid: TxId) -> usize {
        let before = self.statuses.len();
        self.statuses.retain(|&txid, _| txid >= min_txid);
        before.saturating_sub(self.statuses.len())
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

/// The view a transaction has of the version store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub txid: TxId,
    pub start_ts: Timestamp,
    pub isolation: IsolationLevel,
}

impl Snapshot {
    /// Checks if `version` is visible to the transaction owning this snapshot.
    ///
    /// # Visibility Rules
    ///
    /// - READ_UNCOMMITTED: every published version.
    /// - READ_COMMITTED: own writes, or versions with `ts <= start_ts` whose
    ///   writer is committed.
    /// - REPEATABLE_READ and SERIALIZABLE: own writes, or versions with
    ///   `ts < start_ts`.
    pub fn is_visible(&self, version: &Version, statuses: &StatusTable) -> bool {
        match self.isolation {
            IsolationLevel::ReadUncommitted => true,
            IsolationLevel::ReadCommitted => {
                version.txid == self.txid
                    || (version.ts <= self.start_ts && statuses.is_committed(version.txid))
            }
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                version.ts < self.start_ts || version.txid == self.txid
            }
        }
    }
}

/// Buffered writes, in the order keys were first written. `None` is a delete.
#[derive(Debug, Default)]
struct WriteSet {
    ops: Vec<(Key, Option<Value>)>,
    positions: HashMap<Key, usize>,
}

impl WriteSet {
    fn record(&mut self, key: Key, value: Option<Value>) {
        match self.positions.get(&key) {
            Some(&at) => self.ops[at].1 = value,
            None => {
                self.positions.insert(key.clone(), self.ops.len());
                self.ops.push((key, value));
            }
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<&Option<Value>> {
        self.positions.get(key).map(|&at| &self.ops[at].1)
    }
}

/// A single, isolated transaction.
///
/// Dropping a transaction that is still ACTIVE rolls it back.
pub struct Transaction {
    id: TxId,
    isolation: IsolationLevel,
    start_ts: Timestamp,
    commit_ts: AtomicU64,
    status: AtomicU8,
    /// Set when a commit failed after the COMMIT record reached the log.
    indeterminate: AtomicBool,
    read_set: Mutex<HashSet<Key>>,
    write_set: Mutex<WriteSet>,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// The commit timestamp, once the transaction has committed.
    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self.commit_ts.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// `true` if a failed commit may still be applied by recovery. Rolling the
    /// transaction back records an ABORT in the log to prevent that.
    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            txid: self.id,
            start_ts: self.start_ts,
            isolation: self.isolation,
        }
    }

    /// Number of distinct keys written so far.
    pub fn write_count(&self) -> usize {
        self.write_set.lock().ops.len()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::Active => Ok(()),
            status => Err(FluxError::InvalidState {
                txid: self.id,
                status,
            }),
        }
    }

    /// Returns this transaction's own pending write for `key`, if any.
    pub(crate) fn pending(&self, key: &[u8]) -> Option<Option<Value>> {
        self.write_set.lock().lookup(key).cloned()
    }

    /// Own writes with `start <= key` (and `key <= end` when bounded), in key order.
    pub(crate) fn pending_range(&self, start: &[u8], end: Option<&[u8]>) -> BTreeMap<Key, Option<Value>> {
        self.write_set
            .lock()
            .ops
            .iter()
            .filter(|(key, _)| &**key >= start && end.map_or(true, |end| &**key <= end))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn track_read(&self, key: &[u8]) -> Result<()> {
        if self.isolation == IsolationLevel::Serializable {
            self.read_set.lock().insert(make_key(key)?);
        }
        Ok(())
    }

    fn finish(&self, status: TransactionStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("start_ts", &self.start_ts)
            .field("commit_ts", &self.commit_ts())
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status() == TransactionStatus::Active {
            debug!(txid = self.id, "rolling back transaction dropped while active");
            if let Err(e) = self.manager.rollback(self) {
                warn!(txid = self.id, error = %e, "implicit rollback failed");
            }
        }
    }
}

/// Running totals kept by the transaction manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
}

/// Hands out publish turns in the order commits were logged.
#[derive(Debug, Default)]
struct Sequencer {
    turn: Mutex<u64>,
    turn_changed: Condvar,
}

impl Sequencer {
    fn wait_for(&self, ticket: u64) {
        let mut turn = self.turn.lock();
        while *turn != ticket {
            self.turn_changed.wait(&mut turn);
        }
    }

    fn advance(&self) {
        *self.turn.lock() += 1;
        self.turn_changed.notify_all();
    }
}

/// Manages the lifecycle of all transactions.
pub struct TransactionManager {
    store: Arc<VersionStore>,
    wal: Option<Arc<PersistenceEngine>>,
    sync_timeout: Option<Duration>,
    /// The next transaction id to hand out.
    next_txid: CachePadded<AtomicU64>,
    /// The last timestamp handed out.
    clock: CachePadded<AtomicU64>,
    /// Active transactions keyed by start timestamp.
    registry: Mutex<BTreeMap<Timestamp, TxId>>,
    statuses: StatusTable,
    /// Serializes validation and logging; holds the next publish ticket.
    commit_lock: Mutex<u64>,
    /// Keys of commits that are logged but not yet published.
    in_flight: Mutex<HashMap<Key, usize>>,
    sequencer: Sequencer,
    counters: Counters,
}

impl TransactionManager {
    /// Creates a manager over `store`, logging to `wal` when one is given.
    pub fn new(store: Arc<VersionStore>, wal: Option<Arc<PersistenceEngine>>) -> Self {
        TransactionManager {
            store,
            wal,
            sync_timeout: None,
            next_txid: CachePadded::new(AtomicU64::new(1)),
            clock: CachePadded::new(AtomicU64::new(0)),
            registry: Mutex::new(BTreeMap::new()),
            statuses: StatusTable::default(),
            commit_lock: Mutex::new(0),
            in_flight: Mutex::new(HashMap::new()),
            sequencer: Sequencer::default(),
            counters: Counters::default(),
        }
    }

    /// Bounds how long a commit waits for its WAL sync.
    pub fn with_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Continues numbering after a recovered log: the next transaction id is
    /// `last_txid + 1` and the next timestamp `last_ts + 1`.
    pub fn resume_from(self, last_txid: TxId, last_ts: Timestamp) -> Self {
        self.next_txid.store(last_txid + 1, Ordering::SeqCst);
        self.clock.store(last_ts, Ordering::SeqCst);
        self
    }

    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    pub fn statuses(&self) -> &StatusTable {
        &self.statuses
    }

    /// The last timestamp handed out.
    pub fn current_ts(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    pub(crate) fn tick(&self) -> Timestamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn counts(&self) -> TransactionCounts {
        TransactionCounts {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
        }
    }

    /// Begins a new transaction.
    pub fn begin(self: &Arc<Self>, isolation: IsolationLevel) -> Transaction {
        let id = self.next_txid.fetch_add(1, Ordering::SeqCst);
        self.statuses.set(id, TransactionStatus::Active);
        let start_ts = {
            let mut registry = self.registry.lock();
            let ts = self.tick();
            registry.insert(ts, id);
            ts
        };
        self.counters.begun.fetch_add(1, Ordering::Relaxed);

        Transaction {
            id,
            isolation,
            start_ts,
            commit_ts: AtomicU64::new(0),
            status: AtomicU8::new(TransactionStatus::Active.as_u8()),
            indeterminate: AtomicBool::new(false),
            read_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(WriteSet::default()),
            manager: Arc::clone(self),
        }
    }

    /// The oldest start timestamp among active transactions, or the next
    /// timestamp when none is active.
    pub fn watermark(&self) -> Timestamp {
        let registry = self.registry.lock();
        match registry.keys().next() {
            Some(&oldest) => oldest,
            None => self.current_ts() + 1,
        }
    }

    /// The smallest transaction id still active, or the next id when none is.
    pub(crate) fn min_active_txid(&self) -> TxId {
        let registry = self.registry.lock();
        registry
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| self.next_txid.load(Ordering::SeqCst))
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Reads `key` as seen by `txn`.
    pub fn read(&self, txn: &Transaction, key: &[u8]) -> Result<Value> {
        txn.ensure_active()?;
        validate_key(key)?;
        metrics::counter!(m::OPERATIONS_TOTAL, m::LABEL_OPERATION_TYPE => "get").increment(1);

        if let Some(pending) = txn.pending(key) {
            return pending.ok_or(FluxError::NotFound);
        }
        txn.track_read(key)?;
        match self.store.get(key, &txn.snapshot(), &self.statuses) {
            Lookup::Found(value) => Ok(value),
            Lookup::Deleted | Lookup::Invisible | Lookup::Absent => Err(FluxError::NotFound),
        }
    }

    /// Buffers a write (`Some`) or delete (`None`) of `key` in `txn`.
    pub fn write(&self, txn: &Transaction, key: &[u8], value: Option<Value>) -> Result<()> {
        txn.ensure_active()?;
        let op = if value.is_some() { "put" } else { "delete" };
        metrics::counter!(m::OPERATIONS_TOTAL, m::LABEL_OPERATION_TYPE => op).increment(1);
        let key = make_key(key)?;
        txn.write_set.lock().record(key, value);
        Ok(())
    }

    /// Commits `txn`.
    ///
    /// On any error the transaction stays ACTIVE and the caller must roll it
    /// back. After an `Io` or `Timeout` error the transaction is also
    /// indeterminate (see [`Transaction::is_indeterminate`]) and every further
    /// commit fails with [`FluxError::Indeterminate`].
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        txn.ensure_active()?;
        if txn.is_indeterminate() {
            return Err(FluxError::Indeterminate { txid: txn.id });
        }
        let ops = txn.write_set.lock().ops.clone();
        if ops.is_empty() {
            self.finish_read_only(txn);
            return Ok(());
        }

        // Phase 1: validate and log.
        let (ticket, last_sequence) = {
            let mut next_ticket = self.commit_lock.lock();
            if let Err(e) = self.validate(txn, &ops) {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::TRANSACTIONS_TOTAL, m::LABEL_STATUS => "conflict").increment(1);
                return Err(e);
            }

            let last_sequence = match &self.wal {
                Some(wal) => match Self::log_write_set(wal, txn, &ops) {
                    Ok(seq) => Some(seq),
                    Err(e) => {
                        self.mark_indeterminate(txn, &e);
                        return Err(e);
                    }
                },
                None => None,
            };

            let mut in_flight = self.in_flight.lock();
            for (key, _) in &ops {
                *in_flight.entry(key.clone()).or_insert(0) += 1;
            }
            drop(in_flight);

            let ticket = *next_ticket;
            *next_ticket += 1;
            (ticket, last_sequence)
        };

        // Phase 2: durability.
        let durable = match (&self.wal, last_sequence) {
            (Some(wal), Some(seq)) if wal.commit_waits_for_sync() => {
                wal.sync_through(seq, self.sync_timeout)
            }
            _ => Ok(()),
        };

        // Phase 3: publish in log order.
        self.sequencer.wait_for(ticket);
        let outcome = match durable {
            Ok(()) => self.publish(txn, &ops),
            Err(e) => {
                self.mark_indeterminate(txn, &e);
                Err(e)
            }
        };
        self.sequencer.advance();

        let mut in_flight = self.in_flight.lock();
        for (key, _) in &ops {
            if let Some(count) = in_flight.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    in_flight.remove(key);
                }
            }
        }
        outcome
    }

    /// Rolls `txn` back.
    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        txn.ensure_active()?;
        if txn.is_indeterminate() {
            if let Some(wal) = &self.wal {
                let logged = wal
                    .append_entry(txn.id, RecordType::Abort, &[], &[])
                    .and_then(|seq| wal.sync_through(seq, self.sync_timeout));
                if let Err(e) = logged {
                    warn!(txid = txn.id, error = %e, "could not log abort for indeterminate transaction");
                }
            }
        }

        self.registry.lock().remove(&txn.start_ts);
        self.statuses.set(txn.id, TransactionStatus::Aborted);
        txn.finish(TransactionStatus::Aborted);
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::TRANSACTIONS_TOTAL, m::LABEL_STATUS => "aborted").increment(1);
        Ok(())
    }

    /// First-committer-wins validation under the commit lock.
    fn validate(&self, txn: &Transaction, ops: &[(Key, Option<Value>)]) -> Result<()> {
        if !matches!(
            txn.isolation,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        ) {
            return Ok(());
        }

        let in_flight = self.in_flight.lock();
        let overtaken = |key: &[u8]| {
            in_flight.contains_key(key)
                || self
                    .store
                    .newest_ts(key)
                    .is_some_and(|ts| ts > txn.start_ts)
        };

        if ops.iter().any(|(key, _)| overtaken(key)) {
            return Err(FluxError::Conflict { txid: txn.id });
        }
        if txn.isolation == IsolationLevel::Serializable
            && txn.read_set.lock().iter().any(|key| overtaken(key))
        {
            return Err(FluxError::Conflict { txid: txn.id });
        }
        Ok(())
    }

    fn log_write_set(wal: &PersistenceEngine, txn: &Transaction, ops: &[(Key, Option<Value>)]) -> Result<u64> {
        for (key, value) in ops {
            match value {
                Some(value) => wal.append_entry(txn.id, RecordType::Put, key, value)?,
                None => wal.append_entry(txn.id, RecordType::Delete, key, &[])?,
            };
        }
        wal.append_entry(txn.id, RecordType::Commit, &[], &[])
    }

    fn publish(&self, txn: &Transaction, ops: &[(Key, Option<Value>)]) -> Result<()> {
        let mut registry = self.registry.lock();
        let commit_ts = self.tick();
        self.statuses.set(txn.id, TransactionStatus::Committed);

        let mut outcome = Ok(());
        for (key, value) in ops {
            let installed = match value {
                Some(value) => self.store.put(key, txn.id, commit_ts, value.clone()),
                None => self.store.delete(key, txn.id, commit_ts),
            };
            if let Err(e) = installed {
                // The COMMIT record is already in the log, so recovery will
                // apply the whole write set; report the failure but finish.
                error!(txid = txn.id, error = %e, "failed to publish committed version");
                outcome = Err(e);
                break;
            }
        }
        registry.remove(&txn.start_ts);
        drop(registry);

        txn.commit_ts.store(commit_ts, Ordering::Release);
        txn.finish(TransactionStatus::Committed);
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::TRANSACTIONS_TOTAL, m::LABEL_STATUS => "committed").increment(1);
        metrics::gauge!(m::MEMORY_USAGE_BYTES).set(self.store.memory_bytes() as f64);
        outcome
    }

    fn finish_read_only(&self, txn: &Transaction) {
        let mut registry = self.registry.lock();
        let commit_ts = self.tick();
        self.statuses.set(txn.id, TransactionStatus::Committed);
        registry.remove(&txn.start_ts);
        drop(registry);

        txn.commit_ts.store(commit_ts, Ordering::Release);
        txn.finish(TransactionStatus::Committed);
        self.counters.committed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::TRANSACTIONS_TOTAL, m::LABEL_STATUS => "committed").increment(1);
    }

    fn mark_indeterminate(&self, txn: &Transaction, cause: &FluxError) {
        if cause.is_indeterminate() {
            txn.indeterminate.store(true, Ordering::Release);
            warn!(txid = txn.id, error = %cause, "commit outcome is indeterminate; transaction must be rolled back");
            metrics::counter!(m::TRANSACTIONS_TOTAL, m::LABEL_STATUS => "indeterminate").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new(Arc::new(VersionStore::new()), None))
    }

    fn val(bytes: &[u8]) -> Option<Value> {
        Some(Value::new(bytes).unwrap())
    }

    fn version(txid: TxId, ts: Timestamp) -> Version {
        Version {
            txid,
            ts,
            value: val(b"x"),
        }
    }

    #[test]
    fn visibility_rules_per_isolation_level() {
        let statuses = StatusTable::default();
        let snap = |isolation| Snapshot {
            txid: 7,
            start_ts: 20,
            isolation,
        };

        let ru = snap(IsolationLevel::ReadUncommitted);
        assert!(ru.is_visible(&version(1, 99), &statuses));

        let rr = snap(IsolationLevel::RepeatableRead);
        assert!(rr.is_visible(&version(1, 19), &statuses));
        assert!(!rr.is_visible(&version(1, 20), &statuses));
        assert!(!rr.is_visible(&version(1, 21), &statuses));
        assert!(rr.is_visible(&version(7, 99), &statuses));

        let rc = snap(IsolationLevel::ReadCommitted);
        assert!(rc.is_visible(&version(1, 20), &statuses));
        assert!(!rc.is_visible(&version(1, 21), &statuses));
        statuses.set(2, TransactionStatus::Active);
        assert!(!rc.is_visible(&version(2, 10), &statuses));
        statuses.set(2, TransactionStatus::Committed);
        assert!(rc.is_visible(&version(2, 10), &statuses));
    }

    #[test]
    fn ids_and_timestamps_strictly_increase() {
        let tm = manager();
        let a = tm.begin(IsolationLevel::RepeatableRead);
        let b = tm.begin(IsolationLevel::RepeatableRead);
        assert!(b.id() > a.id());
        assert!(b.start_ts() > a.start_ts());

        b.manager.write(&b, b"k", val(b"v")).unwrap();
        tm.commit(&b).unwrap();
        assert!(b.commit_ts().unwrap() > b.start_ts());
    }

    #[test]
    fn scenario_with_forward_allocated_timestamps() {
        let tm = Arc::new(TransactionManager::new(Arc::new(VersionStore::new()), None).resume_from(0, 9));

        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(t1.start_ts(), 10);
        tm.write(&t1, b"a", val(b"v1")).unwrap();
        tm.commit(&t1).unwrap();
        assert_eq!(t1.commit_ts(), Some(11));

        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(t2.start_ts(), 12);
        assert_eq!(tm.read(&t2, b"a").unwrap(), b"v1");

        // A snapshot older than the commit must not see it.
        let t3 = Snapshot {
            txid: 99,
            start_ts: 9,
            isolation: IsolationLevel::RepeatableRead,
        };
        assert_eq!(tm.store().get(b"a", &t3, tm.statuses()), Lookup::Invisible);
    }

    #[test]
    fn status_transitions_are_terminal() {
        let tm = manager();
        let txn = tm.begin(IsolationLevel::ReadCommitted);
        tm.commit(&txn).unwrap();
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert!(matches!(
            tm.commit(&txn),
            Err(FluxError::InvalidState { status: TransactionStatus::Committed, .. })
        ));
        assert!(matches!(tm.rollback(&txn), Err(FluxError::InvalidState { .. })));
        assert!(matches!(tm.read(&txn, b"k"), Err(FluxError::InvalidState { .. })));

        let other = tm.begin(IsolationLevel::ReadCommitted);
        tm.rollback(&other).unwrap();
        assert_eq!(other.status(), TransactionStatus::Aborted);
        assert!(matches!(tm.write(&other, b"k", None), Err(FluxError::InvalidState { .. })));
    }

    #[test]
    fn rollback_discards_the_write_set() {
        let tm = manager();
        let txn = tm.begin(IsolationLevel::RepeatableRead);
        tm.write(&txn, b"k", val(b"v")).unwrap();
        assert_eq!(tm.read(&txn, b"k").unwrap(), b"v");
        tm.rollback(&txn).unwrap();

        let reader = tm.begin(IsolationLevel::RepeatableRead);
        assert!(matches!(tm.read(&reader, b"k"), Err(FluxError::NotFound)));
        assert_eq!(tm.store().key_count(), 0);
    }

    #[test]
    fn watermark_tracks_the_oldest_active_transaction() {
        let tm = manager();
        let a = tm.begin(IsolationLevel::RepeatableRead);
        let b = tm.begin(IsolationLevel::RepeatableRead);
        assert_eq!(tm.watermark(), a.start_ts());
        tm.rollback(&a).unwrap();
        assert_eq!(tm.watermark(), b.start_ts());
        tm.commit(&b).unwrap();
        assert_eq!(tm.watermark(), tm.current_ts() + 1);
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    fn dropping_an_active_transaction_rolls_it_back() {
        let tm = manager();
        {
            let txn = tm.begin(IsolationLevel::RepeatableRead);
            tm.write(&txn, b"k", val(b"v")).unwrap();
        }
        assert_eq!(tm.active_count(), 0);
        assert_eq!(tm.counts().aborted, 1);
    }

    #[test]
    fn first_committer_wins_under_repeatable_read() {
        let tm = manager();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        tm.write(&t1, b"k", val(b"one")).unwrap();
        tm.write(&t2, b"k", val(b"two")).unwrap();

        tm.commit(&t1).unwrap();
        assert!(matches!(tm.commit(&t2), Err(FluxError::Conflict { .. })));
        assert_eq!(t2.status(), TransactionStatus::Active);
        tm.rollback(&t2).unwrap();
        assert_eq!(tm.counts().conflicts, 1);
    }

    #[test]
    fn read_committed_writers_do_not_conflict() {
        let tm = manager();
        let t1 = tm.begin(IsolationLevel::ReadCommitted);
        let t2 = tm.begin(IsolationLevel::ReadCommitted);
        tm.write(&t1, b"k", val(b"one")).unwrap();
        tm.write(&t2, b"k", val(b"two")).unwrap();
        tm.commit(&t1).unwrap();
        tm.commit(&t2).unwrap();

        let reader = tm.begin(IsolationLevel::ReadCommitted);
        assert_eq!(tm.read(&reader, b"k").unwrap(), b"two");
    }

    #[test]
    fn serializable_rejects_write_skew() {
        let tm = manager();
        let seed = tm.begin(IsolationLevel::Serializable);
        tm.write(&seed, b"x", val(b"1")).unwrap();
        tm.write(&seed, b"y", val(b"1")).unwrap();
        tm.commit(&seed).unwrap();

        let t1 = tm.begin(IsolationLevel::Serializable);
        let t2 = tm.begin(IsolationLevel::Serializable);
        tm.read(&t1, b"x").unwrap();
        tm.read(&t1, b"y").unwrap();
        tm.read(&t2, b"x").unwrap();
        tm.read(&t2, b"y").unwrap();
        tm.write(&t1, b"x", val(b"0")).unwrap();
        tm.write(&t2, b"y", val(b"0")).unwrap();

        tm.commit(&t1).unwrap();
        assert!(matches!(tm.commit(&t2), Err(FluxError::Conflict { .. })));
    }

    #[test]
    fn write_set_keeps_first_write_order_and_last_value() {
        let mut ws = WriteSet::default();
        ws.record(Box::from(&b"b"[..]), val(b"1"));
        ws.record(Box::from(&b"a"[..]), val(b"2"));
        ws.record(Box::from(&b"b"[..]), None);

        let keys: Vec<&[u8]> = ws.ops.iter().map(|(k, _)| &**k).collect();
        assert_eq!(keys, vec![&b"b"[..], &b"a"[..]]);
        assert_eq!(ws.lookup(b"b"), Some(&None));
    }

    #[test]
    fn indeterminate_commit_only_allows_rollback() {
        use crate::persistence::{DurabilityLevel, PersistenceOptions};

        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(
            PersistenceEngine::open(&DurabilityLevel::Full {
                options: PersistenceOptions::new(dir.path().join("fluxkv.wal")),
            })
            .unwrap()
            .unwrap(),
        );
        let tm = Arc::new(
            TransactionManager::new(Arc::new(VersionStore::new()), Some(Arc::clone(&wal)))
                .with_sync_timeout(Some(Duration::from_nanos(1))),
        );

        let txn = tm.begin(IsolationLevel::RepeatableRead);
        tm.write(&txn, b"k", val(b"v")).unwrap();
        assert!(matches!(tm.commit(&txn), Err(FluxError::Timeout(_))));
        assert!(txn.is_indeterminate());
        assert_eq!(txn.status(), TransactionStatus::Active);

        let retry = tm.commit(&txn);
        assert!(matches!(retry, Err(FluxError::Indeterminate { txid }) if txid == txn.id));
        tm.rollback(&txn).unwrap();
        assert_eq!(txn.status(), TransactionStatus::Aborted);

        wal.sync().unwrap();
        let records: Vec<_> = wal.recovery_iterator().unwrap().map(|r| r.unwrap()).collect();
        let count = |kind: RecordType| {
            records
                .iter()
                .filter(|r| r.txn_id == txn.id && r.record_type == kind)
                .count()
        };
        assert_eq!(count(RecordType::Put), 1);
        assert_eq!(count(RecordType::Commit), 1);
        assert_eq!(count(RecordType::Abort), 1);
    }
}
