//! Memdex: an embeddable in-memory document database.
//!
//! Documents live in namespaces with typed secondary indexes (hash, tree,
//! composite, fulltext, rtree); queries run through a cost-ordered merge
//! loop with joins, aggregations and forced sorting; writes go through a
//! per-namespace WAL and can replicate to slave instances.
//!
//! ```no_run
//! use memdex::{IndexDef, IndexOpts, IndexType, KeyValueKind, Memdex, MemdexContext, Query};
//!
//! # fn main() -> memdex::Result<()> {
//! let db = Memdex::new();
//! let ctx = MemdexContext::new();
//! db.open_namespace("items", Default::default(), &ctx)?;
//! db.add_index(
//!     "items",
//!     IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
//!     &ctx,
//! )?;
//! db.upsert("items", r#"{"id": 1, "name": "widget"}"#, &ctx)?;
//! let results = db.select_sql("SELECT * FROM items WHERE id = 1", &ctx)?;
//! assert_eq!(results.count(), 1);
//! # Ok(())
//! # }
//! ```

pub use memdex_core::{
    cjson_decode, cjson_encode, doc_from_json, doc_to_json, DatabaseRegistry, Item,
    ItemModifyMode, Memdex, MemdexContext, NamespaceConfig, OptimizationState, ReplicationConfig,
    ReplicationStatus, Replicator, StorageOpts, Transaction, UpdatesFilters, UpdatesObserver,
    WalRecord, WalRecordKind,
};
pub use memdex_error::{ErrorCode, MemdexError, Result};
pub use memdex_index::{IndexDef, IndexType};
pub use memdex_parser::parse_sql;
pub use memdex_query::{
    AggType, AggregateEntry, CalcTotalMode, CondType, JoinType, JoinedQuery, OpType, Query,
    QueryEntry, QueryJoinEntry, SortingEntry, StrictMode,
};
pub use memdex_select::{current_query, AggregationResult, FacetResult, QueryResults};
pub use memdex_types::{
    CollateMode, CollateOpts, IndexOpts, ItemRef, KeyValueKind, Lsn, LsnPair, RowId, Variant,
};
