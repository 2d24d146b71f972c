//! The memdex engine core: namespaces, transactions, the copy-on-write
//! cloner, the per-namespace WAL and the master->slave replication
//! consumer, behind the [`Memdex`] database handle.
//!
//! Data lives in memory; a pluggable key-value [`Storage`] provides
//! durability as an append-only change-record sink plus a bulk load source.

mod cjson;
mod cloner;
mod context;
mod database;
mod item;
mod namespace;
mod observer;
mod replication;
mod storage;
mod transaction;
mod wal;

pub use cjson::{decode as cjson_decode, doc_from_json, doc_to_json, encode as cjson_encode};
pub use cloner::NsCloner;
pub use context::MemdexContext;
pub use database::{DatabaseRegistry, Memdex, StorageOpts};
pub use item::Item;
pub use namespace::{
    ItemModifyMode, JoinPreparedData, Namespace, NamespaceConfig, OptimizationState,
    ReplicationState,
};
pub use observer::{ObserverRegistry, UpdatesFilters, UpdatesObserver};
pub use replication::{ReplicationConfig, ReplicationStatus, Replicator};
pub use storage::{validate_storage_name, ChangeRecord, MemStorage, Storage};
pub use transaction::{Transaction, TxStep};
pub use wal::{WalRecord, WalRecordKind, WalRing, DEFAULT_WAL_SIZE};
