//! Transactional key-value storage used to persist bucket state.
//!
//! The rate limiter only ever talks to storage through the [`Store`] and
//! [`Transaction`] traits: scoped transactions over opaque byte keys with
//! get/set/delete and an explicit commit. Absence of a key is reported as
//! `Ok(None)`, never as an error.

mod memory;

pub use memory::{MemoryStore, MemoryTxn};

use thiserror::Error;

/// Errors surfaced by a [`Store`] or one of its transactions.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A key read by this transaction was committed by someone else first.
    #[error("transaction conflict, retry the operation")]
    Conflict,

    /// A write was attempted on a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// A stored value could not be decoded.
    #[error("corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Snapshot (de)serialization failures
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors from the snapshot file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback run once a transaction's writes have been committed.
pub type CommitHook = Box<dyn FnOnce() + Send>;

/// A handle capable of opening transactions.
pub trait Store: Send + Sync + 'static {
    /// The transaction type handed out by [`Store::begin`].
    type Txn: Transaction;

    /// Open a new transaction. Writes are only allowed when `writable` is set.
    fn begin(&self, writable: bool) -> Result<Self::Txn, StoreError>;

    /// Run `f` inside a read-write transaction and commit it.
    ///
    /// The transaction is discarded if `f` fails.
    fn update<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Self::Txn) -> Result<R, E>,
    {
        let mut txn = self.begin(true)?;
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Run `f` inside a read-only transaction.
    fn view<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Self::Txn) -> Result<R, E>,
    {
        let mut txn = self.begin(false)?;
        let out = f(&mut txn)?;
        txn.discard();
        Ok(out)
    }
}

/// A single scoped transaction.
///
/// Dropping a transaction without committing it discards its writes.
pub trait Transaction: Send {
    /// Whether this transaction accepts writes.
    fn is_writable(&self) -> bool;

    /// Read a key. Returns `Ok(None)` when the key does not exist.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a key.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// Register `hook` to run after this transaction commits successfully.
    ///
    /// Hooks of one transaction run in registration order, and hooks of
    /// different transactions run in the order those transactions
    /// committed. A discarded or conflicting transaction never runs them.
    /// Hooks may run while the store holds internal locks, so they must
    /// not open transactions themselves.
    fn on_commit(&mut self, hook: CommitHook);

    /// Make this transaction's writes visible and run its commit hooks.
    fn commit(self) -> Result<(), StoreError>;

    /// Throw this transaction's writes away.
    fn discard(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}
