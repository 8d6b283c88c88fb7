//! Garbage collection of versions no snapshot can observe.
//!
//! Every active transaction started at or after the watermark, so for each key
//! only the newest version with `ts < watermark` (the *keeper*) and the versions
//! above it can still be read. Vacuum cuts the chain below the keeper and hands
//! the tail to the epoch collector.
//!
//! A keeper that is also the chain head and a tombstone means the key reads as
//! absent for everyone. Vacuum then seals the chain (tag 1 on the head) and
//! retires the key from the index. A writer that finds a sealed chain helps
//! retire it and starts a fresh one.

use crate::metrics as m;
use crate::transaction::{Timestamp, TransactionManager};
use crate::version::VersionStore;
use crossbeam_epoch as epoch;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::debug;

/// Settings for the background vacuum worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacuumOptions {
    /// Pause between two vacuum passes.
    pub interval: Duration,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        VacuumOptions {
            interval: Duration::from_secs(1),
        }
    }
}

/// What one vacuum pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub versions_removed: usize,
    pub keys_removed: usize,
    pub statuses_pruned: usize,
    pub bytes_released: u64,
}

impl VersionStore {
    /// Reclaims versions that no snapshot at or after `watermark` can observe.
    ///
    /// Runs concurrently with readers and writers; passes are serialized.
    pub fn gc(&self, watermark: Timestamp) -> GcStats {
        let _exclusive = self.gc_lock.lock();
        let started = Instant::now();
        let guard = &epoch::pin();
        let mut stats = GcStats::default();
        let mut sealed = Vec::new();

        self.index.scan_from(&[], guard, |key, chain| {
            let mut curr = chain.head.load(Ordering::Acquire, guard);
            let head = curr;

            // SAFETY: chain nodes are only freed through `guard`'s collector.
            while let Some(node) = unsafe { curr.with_tag(0).as_ref() } {
                if node.version.ts >= watermark {
                    curr = node.next.load(Ordering::Acquire, guard);
                    continue;
                }

                // `node` is the keeper. Only vacuum writes a `next` pointer after
                // publication, so the tail can be detached with a plain swap.
                let mut tail = node.next.swap(epoch::Shared::null(), Ordering::AcqRel, guard);
                // SAFETY: the tail is unreachable from the chain now; readers
                // already inside it are protected by their own guards.
                while let Some(dead) = unsafe { tail.as_ref() } {
                    let next = dead.next.load(Ordering::Acquire, guard);
                    stats.versions_removed += 1;
                    stats.bytes_released += dead.version.footprint();
                    unsafe { guard.defer_destroy(tail) };
                    tail = next;
                }

                if curr == head && node.version.is_tombstone() {
                    let seal = chain.head.compare_exchange(
                        head,
                        head.with_tag(1),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    );
                    if seal.is_ok() {
                        stats.bytes_released += node.version.footprint();
                        sealed.push(key.to_vec());
                    }
                }
                break;
            }
            true
        });

        for key in &sealed {
            self.index.delete_if(key, guard, |chain| chain.is_sealed(guard));
        }
        stats.keys_removed = sealed.len();
        self.release(stats.versions_removed, stats.bytes_released);

        metrics::counter!(m::VACUUM_VERSIONS_REMOVED_TOTAL).increment(stats.versions_removed as u64);
        metrics::counter!(m::VACUUM_KEYS_REMOVED_TOTAL).increment(stats.keys_removed as u64);
        metrics::histogram!(m::VACUUM_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        metrics::gauge!(m::MEMORY_USAGE_BYTES).set(self.memory_bytes() as f64);
        stats
    }
}

impl TransactionManager {
    /// Runs one vacuum pass at the current watermark and prunes the status
    /// table below the oldest active transaction.
    pub fn vacuum(&self) -> GcStats {
        let watermark = self.watermark();
        let mut stats = self.store().gc(watermark);
        stats.statuses_pruned = self.statuses().prune_below(self.min_active_txid());
        debug!(
            watermark,
            versions_removed = stats.versions_removed,
            keys_removed = stats.keys_removed,
            statuses_pruned = stats.statuses_pruned,
            "vacuum pass finished"
        );
        stats
    }
}
