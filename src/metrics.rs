//! Defines the metric keys and labels used throughout fluxkv.
//!
//! The engine reports through the [`metrics`] facade; installing a recorder is
//! left to the embedding application.

// --- Metric Keys ---

/// Tracks the total number of finished transactions, labeled by outcome.
///
/// Labels:
/// - `status`: "committed", "aborted", "conflict", "indeterminate"
pub const TRANSACTIONS_TOTAL: &str = "fluxkv_transactions_total";

/// Tracks the total number of user-initiated operations.
///
/// Labels:
/// - `type`: "get", "put", "delete", "range_scan", "prefix_scan"
pub const OPERATIONS_TOTAL: &str = "fluxkv_operations_total";

/// A gauge with the estimated bytes held by published versions.
pub const MEMORY_USAGE_BYTES: &str = "fluxkv_memory_usage_bytes";

/// Tracks the total number of superseded versions reclaimed by vacuum.
pub const VACUUM_VERSIONS_REMOVED_TOTAL: &str = "fluxkv_vacuum_versions_removed_total";

/// Tracks the total number of tombstoned keys removed from the index by vacuum.
pub const VACUUM_KEYS_REMOVED_TOTAL: &str = "fluxkv_vacuum_keys_removed_total";

/// A histogram measuring the duration of a vacuum pass in seconds.
pub const VACUUM_DURATION_SECONDS: &str = "fluxkv_vacuum_duration_seconds";

/// Tracks the total number of bytes written to the write-ahead log file.
pub const WAL_BYTES_WRITTEN_TOTAL: &str = "fluxkv_wal_bytes_written_total";

/// Tracks the total number of buffer flushes, labeled by whether a durability
/// barrier was issued.
///
/// Labels:
/// - `barrier`: "true", "false"
pub const WAL_FLUSHES_TOTAL: &str = "fluxkv_wal_flushes_total";

/// A histogram measuring the duration of a WAL `fsync` in seconds.
pub const WAL_SYNC_DURATION_SECONDS: &str = "fluxkv_wal_sync_duration_seconds";

/// A histogram of how many sync requests one group-commit flush answered.
pub const WAL_GROUP_COMMIT_BATCH_SIZE: &str = "fluxkv_wal_group_commit_batch_size";

/// Tracks the total number of WAL records replayed into the store at startup.
pub const RECOVERY_RECORDS_REPLAYED_TOTAL: &str = "fluxkv_recovery_records_replayed_total";

// --- Label Keys ---

pub const LABEL_STATUS: &str = "status";
pub const LABEL_OPERATION_TYPE: &str = "type";
pub const LABEL_BARRIER: &str = "barrier";
