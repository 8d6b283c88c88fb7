//! Defines the error types used throughout fluxkv.
use crate::transaction::{TransactionStatus, TxId};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A convenient alias for results produced by the engine.
pub type Result<T> = std::result::Result<T, FluxError>;

/// The primary error enum for all fallible operations in fluxkv.
#[derive(Debug, Clone, Error)]
pub enum FluxError {
    /// A caller supplied an argument the engine cannot accept, such as an empty
    /// key or a key whose length does not fit the WAL header.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An allocation failed. The operation that hit it was abandoned before
    /// any structural change became visible.
    #[error("out of memory: failed to reserve {0} bytes")]
    OutOfMemory(usize),

    /// The filesystem failed while writing or syncing the write-ahead log.
    ///
    /// The transaction that observed this error is not committed. The caller
    /// must roll it back; the engine never aborts it on its own.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The key does not exist, or no version of it is visible to the reader.
    #[error("key not found")]
    NotFound,

    /// The transaction lost a write-write or read-write race against a
    /// concurrent commit under REPEATABLE_READ or SERIALIZABLE isolation.
    #[error("transaction {txid} conflicts with a concurrently committed transaction")]
    Conflict { txid: TxId },

    /// A bounded wait on a WAL sync ran out. The log buffer is untouched, so
    /// the sync may be retried, but the transaction must be rolled back.
    #[error("WAL sync did not complete within {0:?}")]
    Timeout(Duration),

    /// An earlier commit of this transaction failed with `Io` or `Timeout`.
    /// Its COMMIT record may be in the log, so the only permitted operation
    /// is rollback.
    #[error("transaction {txid} has an indeterminate commit and must be rolled back")]
    Indeterminate { txid: TxId },

    /// The transaction is no longer ACTIVE.
    #[error("transaction {txid} is {status:?}, expected Active")]
    InvalidState { txid: TxId, status: TransactionStatus },

    /// The engine configuration was rejected.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl FluxError {
    /// Returns `true` for errors that leave a commit in an indeterminate state.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, FluxError::Io(_) | FluxError::Timeout(_))
    }
}

impl From<io::Error> for FluxError {
    fn from(err: io::Error) -> Self {
        FluxError::Io(Arc::new(err))
    }
}
