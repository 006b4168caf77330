//! The storage contract the mapper runs on: named collections of keyed
//! records with atomic transactions. Two drivers ship, in-memory and SQLite;
//! anything honoring these traits can stand in.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryEngine;
pub use sqlite::SqliteEngine;

use crate::error::Result;
use crate::value::{Key, Record};

/// Transaction mode. Writes in a read-only transaction are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// What a storage engine needs to know to create (or upgrade) one
/// collection: its name, where the primary key lives in the record, whether
/// keys are engine-allocated integers, and which fields carry unique
/// secondary indexes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub key_field: String,
    pub auto_increment: bool,
    pub unique_fields: Vec<String>,
}

/// One atomic unit of storage work. All writes are applied by `commit`;
/// dropping the transaction without committing aborts it wholesale.
///
/// Unique secondary indexes are enforced here, at write time.
pub trait Transaction {
    fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>>;

    /// All records in key order (int < date < string).
    fn scan(&self, collection: &str) -> Result<Vec<(Key, Record)>>;

    /// Insert a new record; `DuplicateKey` if the key is already present.
    fn insert(&mut self, collection: &str, key: &Key, record: Record) -> Result<()>;

    /// Insert or replace.
    fn put(&mut self, collection: &str, key: &Key, record: Record) -> Result<()>;

    /// Remove a record; removing an absent key is a no-op.
    fn delete(&mut self, collection: &str, key: &Key) -> Result<()>;

    /// Next integer key for an auto-increment collection.
    fn allocate_key(&mut self, collection: &str) -> Result<Key>;

    fn commit(self) -> Result<()>
    where
        Self: Sized;
}

/// An ordered key-value store organized into named collections.
pub trait StorageEngine {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    /// Create or upgrade collections for a schema version. Re-running with
    /// the same specs is idempotent; existing records are kept.
    fn create_collections(&self, version: u32, specs: &[CollectionSpec]) -> Result<()>;

    /// Start a transaction covering every collection.
    fn begin(&self, mode: TxMode) -> Result<Self::Txn<'_>>;
}
