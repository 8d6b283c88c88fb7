#![doc = include_str!("../README.md")]
//! The lock-free ordered index that every other layer of fluxkv is built on.
//!
//! `OrderedIndex` is a skiplist keyed by byte strings. Each key owns a payload
//! `V`; the version store uses a version chain as the payload, tests and tools
//! may store plain values.
//!
//! # Internals
//!
//! -   **Nodes:** every node owns its key, an atomically swappable payload, a
//!     state (`Inserting`, `Valid`, `Deleted`) and a tower of forward pointers.
//!     Tower heights follow a geometric distribution with p = 1/2, capped at
//!     [`MAX_LEVEL`].
//! -   **Insertion:** a node is linked at level 0 with a single CAS, made
//!     `Valid`, and then linked into its upper levels one CAS at a time.
//! -   **Deletion:** a node is logically deleted by moving its state from
//!     `Valid` to `Deleted`. Its forward pointers are then marked (tag bit 1) so
//!     no new node can be linked behind it, and every traversal that meets a
//!     marked node helps to unlink it.
//! -   **Reclamation:** unlinked nodes are handed to `crossbeam_epoch`, so a
//!     reader that is still standing on a node keeps it alive until it unpins.
//!     A node is only retired once both its inserter and its deleter are done
//!     with it, which rules out a late upper-level link resurrecting a node
//!     that was already scheduled for destruction.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use crate::error::Result;

pub mod db;
pub mod error;
pub mod mem;
pub mod metrics;
pub mod persistence;
pub mod transaction;
pub mod vacuum;
pub mod value;
pub mod version;

pub use crate::db::{Engine, EngineBuilder, EngineConfig, EngineStats};
pub use crate::error::FluxError as Error;
pub use crate::persistence::{DurabilityLevel, PersistenceEngine, PersistenceOptions};
pub use crate::transaction::{
    IsolationLevel, Timestamp, Transaction, TransactionManager, TransactionStatus, TxId,
};
pub use crate::vacuum::{GcStats, VacuumOptions};
pub use crate::value::{Key, Value};
pub use crate::version::VersionStore;

/// The tallest tower a node may have.
pub const MAX_LEVEL: usize = 32;
const DEFAULT_P: f64 = 0.5;

const STATE_INSERTING: u8 = 0;
const STATE_VALID: u8 = 1;
const STATE_DELETED: u8 = 2;

/// The lifecycle state of an index node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Allocated but not yet reachable at level 0.
    Inserting,
    Valid,
    /// Logically removed; physical unlinking may still be in progress.
    Deleted,
}

/// A node in the skiplist.
struct Node<V> {
    key: Box<[u8]>,
    value: Atomic<V>,
    state: AtomicU8,
    /// How many parties (inserter, deleter) still hold the node. The last one
    /// to let go retires it.
    refs: AtomicUsize,
    tower: Box<[Atomic<Node<V>>]>,
}

impl<V> Node<V> {
    /// Creates the sentinel head node spanning every level.
    fn head(max_level: usize) -> Owned<Self> {
        Owned::new(Node {
            key: Box::default(),
            value: Atomic::null(),
            state: AtomicU8::new(STATE_VALID),
            refs: AtomicUsize::new(1),
            tower: (0..max_level).map(|_| Atomic::null()).collect(),
        })
    }

    fn new(key: Box<[u8]>, value: V, height: usize) -> Owned<Self> {
        Owned::new(Node {
            key,
            value: Atomic::new(value),
            state: AtomicU8::new(STATE_INSERTING),
            refs: AtomicUsize::new(2),
            tower: (0..height).map(|_| Atomic::null()).collect(),
        })
    }

    fn height(&self) -> usize {
        self.tower.len()
    }

    fn state(&self) -> NodeState {
        match self.state.load(Ordering::Acquire) {
            STATE_INSERTING => NodeState::Inserting,
            STATE_VALID => NodeState::Valid,
            _ => NodeState::Deleted,
        }
    }

    fn is_deleted(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DELETED
    }

    /// Promotes a node that is already linked at level 0 to `Valid`.
    ///
    /// Any thread that meets such a node may do this, so an insert is never
    /// observed as half done.
    fn settle(&self) {
        let _ = self.state.compare_exchange(
            STATE_INSERTING,
            STATE_VALID,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl<V> Drop for Node<V> {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: a node is dropped only after it became unreachable (or
            // when the whole index is dropped), so nobody else can observe its
            // payload any more.
            let value = self.value.load(Ordering::Relaxed, epoch::unprotected());
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}

/// Predecessors and successors of a key at every level.
struct Position<'g, V> {
    preds: [Shared<'g, Node<V>>; MAX_LEVEL],
    succs: [Shared<'g, Node<V>>; MAX_LEVEL],
}

impl<'g, V> Position<'g, V> {
    fn new() -> Self {
        Position {
            preds: [Shared::null(); MAX_LEVEL],
            succs: [Shared::null(); MAX_LEVEL],
        }
    }

    /// Returns the level-0 successor if it holds exactly `key`.
    fn found(&self, key: &[u8]) -> Option<&'g Node<V>> {
        // SAFETY: successors come from loads made under the caller's guard.
        let node = unsafe { self.succs[0].as_ref() }?;
        (&*node.key == key).then_some(node)
    }
}

/// A concurrent, lock-free ordered map from byte keys to payloads of type `V`.
pub struct OrderedIndex<V> {
    head: CachePadded<Atomic<Node<V>>>,
    max_level: CachePadded<usize>,
    len: CachePadded<AtomicUsize>,
    p: CachePadded<f64>,
}

impl<V: Send + Sync> Default for OrderedIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync> OrderedIndex<V> {
    /// Creates an empty index whose head spans [`MAX_LEVEL`] levels.
    pub fn new() -> Self {
        Self::with_max_level(MAX_LEVEL)
    }

    /// Creates an empty index with a lower tower cap. Values outside
    /// `1..=MAX_LEVEL` are clamped.
    pub fn with_max_level(max_level: usize) -> Self {
        let max_level = max_level.clamp(1, MAX_LEVEL);
        OrderedIndex {
            head: CachePadded::new(Atomic::from(Node::head(max_level))),
            max_level: CachePadded::new(max_level),
            len: CachePadded::new(AtomicUsize::new(0)),
            p: CachePadded::new(DEFAULT_P),
        }
    }

    /// Returns the approximate number of keys in the index.
    ///
    /// This is an approximation because it may not reflect in-flight additions or removals.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the index contains no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_level(&self) -> usize {
        *self.max_level
    }

    fn random_height(&self) -> usize {
        let mut height = 1;
        while height < *self.max_level && fastrand::f64() < *self.p {
            height += 1;
        }
        height
    }

    /// Marks every forward pointer of `node`, top level first. Marking is
    /// idempotent, so helpers and the deleter can race on it.
    fn mark_tower(&self, node: &Node<V>, guard: &Guard) {
        for level in (0..node.height()).rev() {
            node.tower[level].fetch_or(1, Ordering::AcqRel, guard);
        }
    }

    /// Retires `node` once the last of its inserter and deleter is done.
    fn release<'g>(&self, node: Shared<'g, Node<V>>, guard: &'g Guard) {
        // SAFETY: `node` was reached under `guard` and has not been retired,
        // since at least the caller still holds one of its references.
        if unsafe { node.deref() }.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe {
                // SAFETY: both the inserter and the deleter have finished, and
                // each ran a search after its last structural change, so the
                // node is no longer linked at any level.
                guard.defer_destroy(node);
            }
        }
    }

    /// Finds the predecessors and successors of `key` at every level.
    ///
    /// Marked nodes met on the way are unlinked ("helping"), so when this
    /// returns no level of the search path still passes through a node that
    /// was deleted before the search started.
    fn search<'g>(&self, key: &[u8], guard: &'g Guard) -> Position<'g, V> {
        let backoff = Backoff::new();
        'retry: loop {
            let mut pos = Position::new();
            let mut pred = self.head.load(Ordering::Acquire, guard);

            for level in (0..*self.max_level).rev() {
                // SAFETY: `pred` is the head or a node reached under `guard`.
                let mut curr = unsafe { pred.deref() }.tower[level].load(Ordering::Acquire, guard);
                if curr.tag() == 1 {
                    // `pred` itself is being deleted; start over from the head.
                    backoff.spin();
                    continue 'retry;
                }

                // SAFETY: `curr` is either null or a node protected by `guard`.
                while let Some(c) = unsafe { curr.as_ref() } {
                    let succ = c.tower[level].load(Ordering::Acquire, guard);

                    if succ.tag() == 1 || c.is_deleted() {
                        if succ.tag() == 0 {
                            // Deleted but not yet marked: finish the mark first.
                            self.mark_tower(c, guard);
                            continue;
                        }
                        // SAFETY: `pred` is protected by `guard`.
                        let unlinked = unsafe { pred.deref() }.tower[level].compare_exchange(
                            curr,
                            succ.with_tag(0),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        );
                        match unlinked {
                            Ok(_) => curr = succ.with_tag(0),
                            Err(_) => {
                                backoff.spin();
                                continue 'retry;
                            }
                        }
                        continue;
                    }

                    if &*c.key < key {
                        pred = curr;
                        curr = succ;
                    } else {
                        break;
                    }
                }

                pos.preds[level] = pred;
                pos.succs[level] = curr;
            }
            return pos;
        }
    }

    /// Returns the payload stored under `key`, if the key is present.
    pub fn find<'g>(&self, key: &[u8], guard: &'g Guard) -> Option<&'g V> {
        let pos = self.search(key, guard);
        let node = pos.found(key)?;
        node.settle();
        if node.is_deleted() {
            return None;
        }
        // SAFETY: data nodes always carry a payload, protected by `guard`.
        unsafe { node.value.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        let guard = &epoch::pin();
        self.find(key, guard).is_some()
    }

    /// Inserts `value` under `key`, replacing the payload if the key exists.
    pub fn insert(&self, key: &[u8], value: V) -> Result<()> {
        let guard = &epoch::pin();
        self.upsert(key, value, true, guard).map(|_| ())
    }

    /// Returns the payload stored under `key`, inserting `make()` first if the
    /// key is absent.
    pub fn get_or_insert_with<'g, F>(&self, key: &[u8], make: F, guard: &'g Guard) -> Result<&'g V>
    where
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.find(key, guard) {
            return Ok(existing);
        }
        self.upsert(key, make(), false, guard)
    }

    fn upsert<'g>(&self, key: &[u8], value: V, overwrite: bool, guard: &'g Guard) -> Result<&'g V> {
        let owned_key = crate::value::make_key(key)?;
        let height = self.random_height();
        let mut node = Node::new(owned_key, value, height);
        let backoff = Backoff::new();

        let (linked, pos) = loop {
            let pos = self.search(key, guard);

            if let Some(existing) = pos.found(key) {
                existing.settle();
                if !existing.is_deleted() {
                    return Ok(self.merge_into_existing(existing, node, overwrite, guard));
                }
                // Lost a race with a deleter; the search will unlink it.
                backoff.spin();
                continue;
            }

            for level in 0..height {
                node.tower[level].store(pos.succs[level], Ordering::Relaxed);
            }

            // SAFETY: `preds[0]` is the head or a node protected by `guard`.
            let pred = unsafe { pos.preds[0].deref() };
            match pred.tower[0].compare_exchange(
                pos.succs[0],
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(linked) => break (linked, pos),
                Err(err) => {
                    node = err.new;
                    backoff.spin();
                }
            }
        };

        // SAFETY: `linked` was just published under `guard`.
        let linked_ref = unsafe { linked.deref() };
        linked_ref.settle();
        self.len.fetch_add(1, Ordering::Relaxed);

        let payload = linked_ref.value.load(Ordering::Acquire, guard);
        self.link_tower(key, linked, pos, guard);
        self.release(linked, guard);

        // SAFETY: the payload of a node we inserted is non-null, and it stays
        // alive while `guard` is pinned even if the node is deleted meanwhile.
        Ok(unsafe { payload.deref() })
    }

    /// Hands the payload of an unlinked `node` to `existing`, or drops it.
    fn merge_into_existing<'g>(
        &self,
        existing: &'g Node<V>,
        node: Owned<Node<V>>,
        overwrite: bool,
        guard: &'g Guard,
    ) -> &'g V {
        if !overwrite {
            drop(node);
            // SAFETY: data nodes always carry a payload, protected by `guard`.
            return unsafe { existing.value.load(Ordering::Acquire, guard).deref() };
        }

        let payload = node.value.swap(Shared::null(), Ordering::Relaxed, guard);
        drop(node);
        // SAFETY: `payload` came out of a node this thread exclusively owned.
        let payload = unsafe { payload.into_owned() }.into_shared(guard);
        let old = existing.value.swap(payload, Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe {
                // SAFETY: the old payload is unreachable from the index now;
                // readers that loaded it are protected by their own guards.
                guard.defer_destroy(old);
            }
        }
        // SAFETY: `payload` was just published and is protected by `guard`.
        unsafe { payload.deref() }
    }

    /// Links the upper levels of a node that is already present at level 0.
    fn link_tower<'g>(
        &self,
        key: &[u8],
        node: Shared<'g, Node<V>>,
        mut pos: Position<'g, V>,
        guard: &'g Guard,
    ) {
        // SAFETY: the caller holds the inserter's reference to `node`.
        let n = unsafe { node.deref() };
        let backoff = Backoff::new();

        'levels: for level in 1..n.height() {
            loop {
                let next = n.tower[level].load(Ordering::Acquire, guard);
                if next.tag() == 1 {
                    break 'levels;
                }
                let succ = pos.succs[level];
                if next != succ
                    && n.tower[level]
                        .compare_exchange(next, succ, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_err()
                {
                    // Marked under us.
                    break 'levels;
                }

                // SAFETY: predecessors are protected by `guard`.
                let pred = unsafe { pos.preds[level].deref() };
                if pred.tower[level]
                    .compare_exchange(succ, node, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    break;
                }

                backoff.spin();
                pos = self.search(key, guard);
                if pos.succs[0] != node {
                    break 'levels;
                }
            }
        }

        if n.is_deleted() {
            // A deleter may have finished its unlinking pass before our last
            // level went in.
            self.search(key, guard);
        }
    }

    /// Removes `key` if its payload satisfies `predicate`.
    ///
    /// Returns `true` if this call performed the logical deletion.
    pub fn delete_if<F>(&self, key: &[u8], guard: &Guard, predicate: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let pos = self.search(key, guard);
        let Some(node) = pos.found(key) else {
            return false;
        };
        node.settle();

        // SAFETY: data nodes always carry a payload, protected by `guard`.
        let Some(payload) = (unsafe { node.value.load(Ordering::Acquire, guard).as_ref() }) else {
            return false;
        };
        if !predicate(payload) {
            return false;
        }
        if node
            .state
            .compare_exchange(STATE_VALID, STATE_DELETED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.mark_tower(node, guard);
        self.search(key, guard);
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.release(pos.succs[0], guard);
        true
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn delete(&self, key: &[u8]) -> bool {
        let guard = &epoch::pin();
        self.delete_if(key, guard, |_| true)
    }

    /// Walks level 0 in ascending key order starting at the first key `>= start`,
    /// calling `visitor` for each `Valid` node until it returns `false`.
    pub fn scan_from<'g, F>(&self, start: &[u8], guard: &'g Guard, mut visitor: F)
    where
        V: 'g,
        F: FnMut(&'g [u8], &'g V) -> bool,
    {
        let mut curr = if start.is_empty() {
            let head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: the head node lives as long as the index.
            unsafe { head.deref() }.tower[0].load(Ordering::Acquire, guard)
        } else {
            self.search(start, guard).succs[0]
        };

        // SAFETY: every node reached through level 0 is protected by `guard`.
        while let Some(node) = unsafe { curr.with_tag(0).as_ref() } {
            let next = node.tower[0].load(Ordering::Acquire, guard);
            if node.state.load(Ordering::Acquire) == STATE_VALID {
                // SAFETY: data nodes always carry a payload.
                if let Some(value) = unsafe { node.value.load(Ordering::Acquire, guard).as_ref() } {
                    if !visitor(&node.key, value) {
                        return;
                    }
                }
            }
            curr = next;
        }
    }

    /// Visits every `Valid` node in ascending key order.
    ///
    /// The walk is not a snapshot: keys inserted or deleted concurrently may
    /// or may not be seen.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&[u8], &V),
    {
        let guard = &epoch::pin();
        self.scan_from(&[], guard, |key, value| {
            visitor(key, value);
            true
        });
    }

    /// Visits every `Valid` node with `start <= key <= end`.
    pub fn range_for_each<F>(&self, start: &[u8], end: &[u8], mut visitor: F)
    where
        F: FnMut(&[u8], &V),
    {
        let guard = &epoch::pin();
        self.scan_from(start, guard, |key, value| {
            if key > end {
                return false;
            }
            visitor(key, value);
            true
        });
    }

    /// Returns the state of the node holding `key`, if one is linked.
    pub fn node_state(&self, key: &[u8]) -> Option<NodeState> {
        let guard = &epoch::pin();
        self.search(key, guard).found(key).map(Node::state)
    }
}

impl<V> Drop for OrderedIndex<V> {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: `&mut self` guarantees no other thread is traversing the
            // index, and every node still linked at level 0 is owned by it.
            let guard = epoch::unprotected();
            let mut node = self.head.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().tower[0].load(Ordering::Relaxed, guard).with_tag(0);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}
