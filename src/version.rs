//! Per-key version chains and the version store built on the ordered index.
//!
//! Every key in the store owns a [`VersionChain`]: a singly linked list of
//! immutable [`Version`]s, newest first. Writers never modify a published
//! version; they prepend a new one with a CAS on the chain head. Readers walk
//! the chain and return the first version their [`Snapshot`] can see.
//!
//! Deletes are tombstones (a version without a value). Tombstones and
//! superseded versions are reclaimed by [`VersionStore::gc`](crate::vacuum).

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::{Backoff, CachePadded};

use crate::error::Result;
use crate::mem::MemSize;
use crate::transaction::{Snapshot, StatusTable, Timestamp, TxId};
use crate::value::{validate_key, Value};
use crate::OrderedIndex;

/// An immutable, committed value of a key.
#[derive(Debug, Clone)]
pub struct Version {
    /// The transaction that wrote this version.
    pub txid: TxId,
    /// The commit timestamp of that transaction.
    pub ts: Timestamp,
    /// `None` marks a tombstone.
    pub value: Option<Value>,
}

impl Version {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate bytes held by one chain entry.
    pub(crate) fn footprint(&self) -> u64 {
        (std::mem::size_of::<VersionNode>() + self.value.as_ref().map_or(0, |v| v.mem_size())) as u64
    }
}

pub(crate) struct VersionNode {
    pub(crate) version: Version,
    pub(crate) next: Atomic<VersionNode>,
}

impl VersionNode {
    fn new(version: Version) -> Owned<Self> {
        Owned::new(VersionNode {
            version,
            next: Atomic::null(),
        })
    }
}

/// The newest-first list of versions of one key.
///
/// The head pointer carries tag 1 once vacuum has sealed the chain; a sealed
/// chain only ever holds an old tombstone and accepts no more versions.
pub struct VersionChain {
    pub(crate) head: Atomic<VersionNode>,
}

impl VersionChain {
    fn new() -> Self {
        VersionChain {
            head: Atomic::null(),
        }
    }

    pub(crate) fn is_sealed(&self, guard: &Guard) -> bool {
        self.head.load(Ordering::Acquire, guard).tag() == 1
    }

    /// Prepends `node`. Fails, handing the node back, if the chain is sealed.
    fn prepend(&self, mut node: Owned<VersionNode>, guard: &Guard) -> std::result::Result<(), Owned<VersionNode>> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            if head.tag() == 1 {
                return Err(node);
            }
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    node = err.new;
                    backoff.spin();
                }
            }
        }
    }

    /// Iterates the chain from newest to oldest.
    pub fn versions<'g>(&self, guard: &'g Guard) -> impl Iterator<Item = &'g Version> + 'g {
        let mut curr = self.head.load(Ordering::Acquire, guard).with_tag(0);
        std::iter::from_fn(move || {
            // SAFETY: chain nodes are retired through the epoch collector only,
            // and `guard` keeps everything loaded under it alive.
            let node = unsafe { curr.as_ref() }?;
            curr = node.next.load(Ordering::Acquire, guard);
            Some(&node.version)
        })
    }

    pub fn newest<'g>(&self, guard: &'g Guard) -> Option<&'g Version> {
        self.versions(guard).next()
    }
}

impl Drop for VersionChain {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: the chain is dropped when its index node is destroyed,
            // after every reader that could reach it has unpinned.
            let guard = epoch::unprotected();
            let mut node = self.head.load(Ordering::Relaxed, guard).with_tag(0);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}

/// The outcome of a versioned read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The newest visible version holds a value.
    Found(Value),
    /// The newest visible version is a tombstone.
    Deleted,
    /// The key exists but none of its versions is visible to the reader.
    Invisible,
    /// The key is not in the index at all.
    Absent,
}

impl Lookup {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Multi-version key-value storage.
pub struct VersionStore {
    pub(crate) index: OrderedIndex<VersionChain>,
    memory_bytes: CachePadded<AtomicU64>,
    versions_reclaimed: AtomicU64,
    pub(crate) gc_lock: parking_lot::Mutex<()>,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self::with_max_level(crate::MAX_LEVEL)
    }

    pub fn with_max_level(max_level: usize) -> Self {
        VersionStore {
            index: OrderedIndex::with_max_level(max_level),
            memory_bytes: CachePadded::new(AtomicU64::new(0)),
            versions_reclaimed: AtomicU64::new(0),
            gc_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Number of keys in the index, tombstoned ones included.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Estimated bytes held by published versions.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    /// Total versions removed by vacuum since the store was created.
    pub fn versions_reclaimed(&self) -> u64 {
        self.versions_reclaimed.load(Ordering::Relaxed)
    }

    pub(crate) fn release(&self, versions: usize, bytes: u64) {
        self.versions_reclaimed.fetch_add(versions as u64, Ordering::Relaxed);
        self.memory_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Reads the newest version of `key` visible to `snapshot`.
    pub fn get(&self, key: &[u8], snapshot: &Snapshot, statuses: &StatusTable) -> Lookup {
        let guard = &epoch::pin();
        let Some(chain) = self.index.find(key, guard) else {
            return Lookup::Absent;
        };
        Self::visible_in(chain, snapshot, statuses, guard)
    }

    fn visible_in(chain: &VersionChain, snapshot: &Snapshot, statuses: &StatusTable, guard: &Guard) -> Lookup {
        match chain
            .versions(guard)
            .find(|version| snapshot.is_visible(version, statuses))
        {
            Some(Version { value: Some(value), .. }) => Lookup::Found(value.clone()),
            Some(_) => Lookup::Deleted,
            None => Lookup::Invisible,
        }
    }

    /// Publishes `value` as the newest version of `key`.
    pub fn put(&self, key: &[u8], txid: TxId, ts: Timestamp, value: Value) -> Result<()> {
        self.install(key, Version { txid, ts, value: Some(value) })
    }

    /// Publishes a tombstone as the newest version of `key`.
    pub fn delete(&self, key: &[u8], txid: TxId, ts: Timestamp) -> Result<()> {
        self.install(key, Version { txid, ts, value: None })
    }

    fn install(&self, key: &[u8], version: Version) -> Result<()> {
        validate_key(key)?;
        let footprint = version.footprint();
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        let mut node = VersionNode::new(version);

        loop {
            let chain = self.index.get_or_insert_with(key, VersionChain::new, guard)?;
            match chain.prepend(node, guard) {
                Ok(()) => break,
                Err(returned) => {
                    // Vacuum sealed this chain; help it retire the index node
                    // and start a fresh chain.
                    node = returned;
                    self.index.delete_if(key, guard, |chain| chain.is_sealed(guard));
                    backoff.spin();
                }
            }
        }

        self.memory_bytes.fetch_add(footprint, Ordering::Relaxed);
        Ok(())
    }

    /// Commit timestamp of the newest published version of `key`.
    pub fn newest_ts(&self, key: &[u8]) -> Option<Timestamp> {
        let guard = &epoch::pin();
        let chain = self.index.find(key, guard)?;
        chain.newest(guard).map(|version| version.ts)
    }

    /// Visits, in key order, every key in `start..=end` (or from `start` on when
    /// `end` is `None`) with a value visible to `snapshot`. Stops early when
    /// `visitor` returns `false`.
    pub fn scan<F>(&self, start: &[u8], end: Option<&[u8]>, snapshot: &Snapshot, statuses: &StatusTable, mut visitor: F)
    where
        F: FnMut(&[u8], Value) -> bool,
    {
        let guard = &epoch::pin();
        self.index.scan_from(start, guard, |key, chain| {
            if end.is_some_and(|end| key > end) {
                return false;
            }
            match Self::visible_in(chain, snapshot, statuses, guard) {
                Lookup::Found(value) => visitor(key, value),
                _ => true,
            }
        });
    }

    /// Copies every version of `key`, newest first. Intended for diagnostics
    /// and tests.
    pub fn versions_of(&self, key: &[u8]) -> Vec<Version> {
        let guard = &epoch::pin();
        match self.index.find(key, guard) {
            Some(chain) => chain.versions(guard).cloned().collect(),
            None => Vec::new(),
        }
    }
}
