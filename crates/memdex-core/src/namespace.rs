use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memdex_error::{MemdexError, Result};
use memdex_index::{Index, IndexDef, IndexType};
use memdex_query::{CondType, Query, StrictMode};
use memdex_select::{
    Cancellation, JoinedSelector, NsView, PreResultData, QueryCountCache, QueryResults, Selector,
};
use memdex_types::{
    ConstPayload, DocNode, FieldsSet, KeyValueKind, Lsn, LsnPair, Payload, PayloadFieldType,
    PayloadType, PayloadValue, RowId, TagsMatcher, Variant, VariantArray,
};
use parking_lot::{Mutex, RwLock};
use smallvec::smallvec;
use tracing::{debug, trace};

use crate::cjson;
use crate::observer::ObserverRegistry;
use crate::transaction::{Transaction, TxStep};
use crate::storage::{ChangeRecord, Storage};
use crate::wal::{WalRecord, WalRecordKind, WalRing, DEFAULT_WAL_SIZE};

/// Mutations accrued before the background optimizer re-runs.
pub const OPTIMIZATION_COMMITS_THRESHOLD: usize = 0;

/// Item write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemModifyMode {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl ItemModifyMode {
    const fn wal_kind(self) -> WalRecordKind {
        match self {
            Self::Insert => WalRecordKind::ItemInsert,
            Self::Update => WalRecordKind::ItemUpdate,
            Self::Upsert => WalRecordKind::ItemUpsert,
            Self::Delete => WalRecordKind::ItemDelete,
        }
    }

    pub(crate) const fn as_byte(self) -> u8 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Upsert => 2,
            Self::Delete => 3,
        }
    }

    pub(crate) const fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Insert,
            1 => Self::Update,
            3 => Self::Delete,
            _ => Self::Upsert,
        }
    }
}

/// Background optimization progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationState {
    #[default]
    NotOptimized,
    OptimizingIndexes,
    OptimizingSortOrders,
    OptimizationCompleted,
}

impl OptimizationState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotOptimized => "not-optimized",
            Self::OptimizingIndexes => "optimizing-indexes",
            Self::OptimizingSortOrders => "optimizing-sort-orders",
            Self::OptimizationCompleted => "optimization-completed",
        }
    }
}

/// Per-namespace tuning.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub wal_size: usize,
    pub strict_mode: StrictMode,
    /// A transaction larger than this always commits through a namespace
    /// copy.
    pub tx_size_to_always_copy: usize,
    /// A transaction larger than this copies when it is large relative to
    /// the namespace.
    pub tx_size_to_copy: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            wal_size: DEFAULT_WAL_SIZE,
            strict_mode: StrictMode::None,
            tx_size_to_always_copy: 100_000,
            tx_size_to_copy: 10_000,
        }
    }
}

/// Replication role and progress of one namespace.
#[derive(Debug, Clone, Default)]
pub struct ReplicationState {
    pub last_upstream_lsn: Lsn,
    /// Set while a renamed namespace is still a temporary replica target.
    pub temporary: bool,
}

/// Everything a namespace owns, guarded by one reader-writer lock.
#[derive(Clone)]
pub(crate) struct NsState {
    pub name: String,
    pub payload_type: PayloadType,
    pub tags_matcher: TagsMatcher,
    pub items: Vec<PayloadValue>,
    pub free: Vec<RowId>,
    /// Regular indexes first, composites after them.
    pub indexes: Vec<Index>,
    pub wal: WalRing,
    pub meta: HashMap<String, String>,
    pub repl: ReplicationState,
    pub generation: u64,
    pub optimization_state: OptimizationState,
    pub pending_commits: usize,
    pub storage: Option<Arc<dyn Storage>>,
    pub dbpath: String,
}

/// Right-side data of one join, pre-executed by the database handle.
pub struct JoinPreparedData {
    pub join_type: memdex_query::JoinType,
    pub right_ns: String,
    pub on: Vec<memdex_query::QueryJoinEntry>,
    pub right_payload_type: PayloadType,
    pub right_tags_matcher: TagsMatcher,
    pub values: Vec<(RowId, PayloadValue)>,
    pub ns_id: u8,
}

/// An in-memory document namespace: schema, items, indexes, WAL and
/// replication state, under a per-namespace reader-writer lock.
pub struct Namespace {
    state: RwLock<NsState>,
    pub(crate) storage_mtx: Mutex<()>,
    /// Signals in-flight background work to yield before a cloner copy.
    pub(crate) cancel_commit: AtomicBool,
    invalidated: AtomicBool,
    query_cache: QueryCountCache,
    observers: Arc<ObserverRegistry>,
    pub(crate) config: NamespaceConfig,
}

impl Namespace {
    pub fn new(
        name: &str,
        config: NamespaceConfig,
        storage: Option<Arc<dyn Storage>>,
        observers: Arc<ObserverRegistry>,
    ) -> Result<Arc<Self>> {
        crate::storage::validate_storage_name(name)?;
        let state = NsState {
            name: name.to_owned(),
            payload_type: PayloadType::new(name),
            tags_matcher: TagsMatcher::new(),
            items: Vec::new(),
            free: Vec::new(),
            indexes: Vec::new(),
            wal: WalRing::new(config.wal_size),
            meta: HashMap::new(),
            repl: ReplicationState::default(),
            generation: 0,
            optimization_state: OptimizationState::default(),
            pending_commits: 0,
            storage,
            dbpath: name.to_owned(),
        };
        Ok(Arc::new(Self {
            state: RwLock::new(state),
            storage_mtx: Mutex::new(()),
            cancel_commit: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            query_cache: QueryCountCache::new(),
            observers,
            config,
        }))
    }

    /// Deep copy for the cloner's shadow commit. The copy shares the
    /// storage handle and observer registry but nothing mutable.
    pub(crate) fn deep_copy(&self) -> Self {
        let state = self.state.read().clone();
        Self {
            state: RwLock::new(state),
            storage_mtx: Mutex::new(()),
            cancel_commit: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            query_cache: QueryCountCache::new(),
            observers: Arc::clone(&self.observers),
            config: self.config.clone(),
        }
    }

    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    fn check_valid(&self) -> Result<()> {
        if self.invalidated.load(Ordering::Acquire) {
            Err(MemdexError::NamespaceInvalidated)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub(crate) fn set_name(&self, name: &str, dbpath: &str) {
        let mut state = self.state.write();
        state.name = name.to_owned();
        state.dbpath = dbpath.to_owned();
        state.repl.temporary = false;
    }

    #[must_use]
    pub fn items_count(&self) -> usize {
        let state = self.state.read();
        state.items.len() - state.free.len()
    }

    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.state.read().wal.last_lsn()
    }

    /// Last master LSN applied to this (slave) namespace.
    #[must_use]
    pub fn last_upstream_lsn(&self) -> Lsn {
        self.state.read().repl.last_upstream_lsn
    }

    #[must_use]
    pub fn optimization_state(&self) -> OptimizationState {
        self.state.read().optimization_state
    }

    // -----------------------------------------------------------------------
    // Index lifecycle
    // -----------------------------------------------------------------------

    pub fn add_index(&self, def: IndexDef, ctx: &dyn Cancellation) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();
        Self::add_index_under_lock(&mut state, def.clone())?;
        let lsn = state.wal.append(
            WalRecordKind::IndexAdd,
            serde_json::to_vec(&def).map_err(|e| MemdexError::logic(e.to_string()))?,
            0,
        );
        Self::bump(&mut state);
        self.notify(&state, lsn);
        Ok(())
    }

    pub(crate) fn add_index_under_lock(state: &mut NsState, def: IndexDef) -> Result<()> {
        if let Some(existing) = state
            .indexes
            .iter()
            .find(|idx| idx.name().eq_ignore_ascii_case(&def.name))
        {
            if *existing.def() == def {
                return Ok(());
            }
            return Err(MemdexError::exists("index", &def.name));
        }
        if def.opts.is_pk() && state.indexes.iter().any(|idx| idx.opts().is_pk()) {
            return Err(MemdexError::params(format!(
                "namespace '{}' already has a PK index",
                state.name
            )));
        }

        let (fields, sparse_path) = Self::resolve_index_fields(state, &def)?;
        let mut index = Index::create(def.clone(), &state.payload_type, fields, sparse_path)?;

        // Feed existing rows.
        for (row_id, pv) in state.items.clone().iter().enumerate() {
            if pv.is_free() {
                continue;
            }
            // Newly added payload fields must be populated from the doc
            // tree before the index sees the row.
            let mut filled = pv.clone();
            Self::fill_payload_fields(state, &mut filled)?;
            index.upsert(
                &ConstPayload::new(&state.payload_type, &filled),
                &state.tags_matcher,
                row_id as RowId,
            )?;
            state.items[row_id] = filled;
        }

        // Regular indexes sit before composites.
        let insert_at = if index.is_composite() {
            state.indexes.len()
        } else {
            state
                .indexes
                .iter()
                .position(Index::is_composite)
                .unwrap_or(state.indexes.len())
        };
        state.indexes.insert(insert_at, index);
        debug!(ns = %state.name, index = %def.name, "index added");
        Ok(())
    }

    fn resolve_index_fields(
        state: &mut NsState,
        def: &IndexDef,
    ) -> Result<(FieldsSet, Option<memdex_types::TagsPath>)> {
        if def.opts.is_sparse() {
            let path = state.tags_matcher.path2tag_or_add(&def.json_paths[0]);
            return Ok((FieldsSet::new(), Some(path)));
        }
        let mut fields = FieldsSet::new();
        match def.index_type {
            IndexType::Composite => {
                // Composite paths name already-registered fields.
                for path in &def.json_paths {
                    for part in path.split('+') {
                        let pos = state.payload_type.field_by_name(part).ok_or_else(|| {
                            MemdexError::params(format!(
                                "composite index '{}' refers to unknown field '{part}'",
                                def.name
                            ))
                        })?;
                        fields.push(pos as i32);
                    }
                }
            }
            _ => {
                for path in &def.json_paths {
                    let kind = match def.index_type {
                        IndexType::RTree => KeyValueKind::Double,
                        IndexType::Text => KeyValueKind::String,
                        _ => def.field_type,
                    };
                    let pos = match state.payload_type.field_by_name(path) {
                        Some(pos) => pos,
                        None => {
                            let is_array =
                                def.opts.is_array() || def.index_type == IndexType::RTree;
                            state.payload_type.add_field(PayloadFieldType::new(
                                path.clone(),
                                kind,
                                is_array,
                            ))?
                        }
                    };
                    state.tags_matcher.path2tag_or_add(path);
                    fields.push(pos as i32);
                }
            }
        }
        Ok((fields, None))
    }

    pub fn update_index(&self, def: IndexDef, ctx: &dyn Cancellation) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        {
            let mut state = self.state.write();
            let pos = state
                .indexes
                .iter()
                .position(|idx| idx.name().eq_ignore_ascii_case(&def.name))
                .ok_or_else(|| MemdexError::not_found("index", &def.name))?;
            state.indexes.remove(pos);
            Self::add_index_under_lock(&mut state, def.clone())?;
            let lsn = state.wal.append(
                WalRecordKind::IndexUpdate,
                serde_json::to_vec(&def).map_err(|e| MemdexError::logic(e.to_string()))?,
                0,
            );
            Self::bump(&mut state);
            self.notify(&state, lsn);
        }
        Ok(())
    }

    pub fn drop_index(&self, name: &str, ctx: &dyn Cancellation) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();
        let pos = state
            .indexes
            .iter()
            .position(|idx| idx.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| MemdexError::not_found("index", name))?;
        if state.indexes[pos].opts().is_pk() {
            return Err(MemdexError::params(format!(
                "can't drop PK index '{name}'"
            )));
        }
        state.indexes.remove(pos);
        let lsn = state
            .wal
            .append(WalRecordKind::IndexDrop, name.as_bytes().to_vec(), 0);
        Self::bump(&mut state);
        self.notify(&state, lsn);
        Ok(())
    }

    #[must_use]
    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.state
            .read()
            .indexes
            .iter()
            .map(|idx| idx.def().clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Item write path
    // -----------------------------------------------------------------------

    pub fn modify_json(
        &self,
        json: &str,
        mode: ItemModifyMode,
        ctx: &dyn Cancellation,
    ) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();
        if let Some(lsn) = Self::modify_json_under_lock(&mut state, json, mode, 0)? {
            self.notify(&state, lsn);
        }
        Ok(())
    }

    /// Parse, validate and apply one document; returns the WAL LSN, or
    /// `None` when the operation was a no-op.
    pub(crate) fn modify_json_under_lock(
        state: &mut NsState,
        json: &str,
        mode: ItemModifyMode,
        tx_id: u64,
    ) -> Result<Option<Lsn>> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| MemdexError::parse_json(e.to_string()))?;
        let doc = cjson::doc_from_json(&value, &mut state.tags_matcher);
        Self::modify_doc_under_lock(state, doc, mode, tx_id)
    }

    pub(crate) fn modify_doc_under_lock(
        state: &mut NsState,
        doc: DocNode,
        mode: ItemModifyMode,
        tx_id: u64,
    ) -> Result<Option<Lsn>> {
        let mut pv = PayloadValue::new(state.payload_type.num_fields());
        pv.set_doc(doc.clone());
        Self::fill_payload_fields(state, &mut pv)?;

        let pk_pos = state
            .indexes
            .iter()
            .position(|idx| idx.opts().is_pk())
            .ok_or_else(|| {
                MemdexError::params(format!("namespace '{}' has no PK index", state.name))
            })?;
        let pk_values = Self::index_values(state, pk_pos, &pv);
        if pk_values.is_empty() {
            return Err(MemdexError::params(format!(
                "item has no value for PK index '{}'",
                state.indexes[pk_pos].name()
            )));
        }
        let existing = Self::find_by_pk(state, pk_pos, &pk_values)?;

        match (mode, existing) {
            (ItemModifyMode::Insert, Some(_)) => {
                return Err(MemdexError::exists("item with PK", pk_values[0].to_string()));
            }
            (ItemModifyMode::Update | ItemModifyMode::Delete, None) => {
                // Nothing to touch; not an error.
                return Ok(None);
            }
            _ => {}
        }

        let encoded = cjson::encode(&doc, &state.tags_matcher);
        let lsn = if tx_id == 0 {
            state.wal.append(mode.wal_kind(), encoded.clone(), 0)
        } else {
            let mut data = Vec::with_capacity(encoded.len() + 1);
            data.push(mode.as_byte());
            data.extend_from_slice(&encoded);
            state.wal.append(WalRecordKind::TxStep, data, tx_id)
        };
        pv.set_lsn(lsn);

        let mut storage_batch = Vec::new();
        let storage_key = Self::storage_key(&pk_values[0]);

        match mode {
            ItemModifyMode::Delete => {
                let row_id = existing.expect("checked above");
                let old = state.items[row_id as usize].clone();
                for index in &mut state.indexes {
                    index.delete(
                        &ConstPayload::new(&state.payload_type, &old),
                        &state.tags_matcher,
                        row_id,
                    )?;
                }
                state.items[row_id as usize].set_free(true);
                state.free.push(row_id);
                storage_batch.push(ChangeRecord::Remove { key: storage_key });
            }
            _ => {
                let row_id = match existing {
                    Some(row_id) => {
                        let old = state.items[row_id as usize].clone();
                        for index in &mut state.indexes {
                            index.delete(
                                &ConstPayload::new(&state.payload_type, &old),
                                &state.tags_matcher,
                                row_id,
                            )?;
                        }
                        row_id
                    }
                    None => match state.free.pop() {
                        Some(row_id) => row_id,
                        None => {
                            state.items.push(PayloadValue::default());
                            (state.items.len() - 1) as RowId
                        }
                    },
                };
                for index in &mut state.indexes {
                    index.upsert(
                        &ConstPayload::new(&state.payload_type, &pv),
                        &state.tags_matcher,
                        row_id,
                    )?;
                }
                state.items[row_id as usize] = pv;
                storage_batch.push(ChangeRecord::Put {
                    key: storage_key,
                    value: encoded,
                });
            }
        }

        if let Some(storage) = &state.storage {
            storage.write(storage_batch)?;
        }
        Self::bump(state);
        Ok(Some(lsn))
    }

    /// Populate fixed payload slots from the document tree.
    fn fill_payload_fields(state: &NsState, pv: &mut PayloadValue) -> Result<()> {
        pv.resize_slots(state.payload_type.num_fields());
        let doc = pv.doc().clone();
        let mut pl = Payload::new(&state.payload_type, pv);
        for (pos, field) in state.payload_type.fields().enumerate() {
            let mut values = VariantArray::new();
            for path in &field.json_paths {
                let tags = state.tags_matcher.path2tag(path);
                if !tags.is_empty() {
                    doc.collect(tags.as_slice(), &mut values);
                }
            }
            if !values.is_empty() {
                pl.set(pos, values)?;
            }
        }
        Ok(())
    }

    fn index_values(state: &NsState, index_pos: usize, pv: &PayloadValue) -> VariantArray {
        let index = &state.indexes[index_pos];
        let pl = ConstPayload::new(&state.payload_type, pv);
        match index.fields().iter().find(|&f| f >= 0) {
            Some(field) => pl.get(field as usize),
            None => VariantArray::new(),
        }
    }

    fn find_by_pk(state: &NsState, pk_pos: usize, pk_values: &VariantArray) -> Result<Option<RowId>> {
        let opts = memdex_index::SelectOpts {
            items_count: state.items.len(),
            ..Default::default()
        };
        let results = state.indexes[pk_pos].select_key(
            &smallvec![pk_values[0].clone()],
            CondType::Eq,
            0,
            &opts,
        )?;
        for res in results {
            for set in &res.idsets {
                if let Some(id) = set.iter().next() {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    fn storage_key(pk: &Variant) -> Vec<u8> {
        let mut key = b"it:".to_vec();
        key.extend_from_slice(pk.to_string().as_bytes());
        key
    }

    fn bump(state: &mut NsState) {
        state.generation += 1;
        state.pending_commits += 1;
        state.optimization_state = OptimizationState::NotOptimized;
    }

    fn notify(&self, state: &NsState, lsn: Lsn) {
        if let Some(record) = state.wal.get(lsn) {
            self.observers.notify(
                &state.name,
                LsnPair {
                    upstream: lsn,
                    origin: lsn,
                },
                record,
            );
        }
    }

    pub fn truncate(&self, ctx: &dyn Cancellation) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();
        state.items.clear();
        state.free.clear();
        let defs: Vec<IndexDef> = state.indexes.iter().map(|idx| idx.def().clone()).collect();
        state.indexes.clear();
        for def in defs {
            Self::add_index_under_lock(&mut state, def)?;
        }
        if let Some(storage) = &state.storage {
            storage.destroy()?;
        }
        let lsn = state.wal.append(WalRecordKind::Truncate, Vec::new(), 0);
        Self::bump(&mut state);
        self.notify(&state, lsn);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn select(
        &self,
        query: Query,
        joins: Vec<JoinPreparedData>,
        ctx: &dyn Cancellation,
        result: &mut QueryResults,
    ) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let state = self.state.read();
        let joined: Vec<JoinedSelector<'_>> = joins
            .into_iter()
            .map(|data| JoinedSelector {
                join_type: data.join_type,
                right_ns: data.right_ns,
                on: data.on,
                right_payload_type: data.right_payload_type,
                right_tags_matcher: data.right_tags_matcher,
                preresult: PreResultData::Values(data.values),
                enable_sort_orders: false,
                ns_id: data.ns_id,
            })
            .collect();
        let view = NsView {
            name: &state.name,
            payload_type: &state.payload_type,
            tags_matcher: &state.tags_matcher,
            items: &state.items,
            free_count: state.free.len(),
            indexes: &state.indexes,
            sort_orders_built: state.optimization_state == OptimizationState::OptimizationCompleted,
            strict_mode: self.config.strict_mode,
            query_cache: Some(&self.query_cache),
            generation: state.generation,
        };
        let selector = Selector {
            ns: &view,
            joined: &joined,
            cancel: ctx,
        };
        selector.select(query, result)
    }

    /// Copy of every live row, for join preresults and replication dumps.
    #[must_use]
    pub fn dump_items(&self) -> Vec<(RowId, PayloadValue)> {
        let state = self.state.read();
        state
            .items
            .iter()
            .enumerate()
            .filter(|(_, pv)| !pv.is_free())
            .map(|(id, pv)| (id as RowId, pv.clone()))
            .collect()
    }

    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        self.state.read().payload_type.clone()
    }

    #[must_use]
    pub fn tags_matcher(&self) -> TagsMatcher {
        self.state.read().tags_matcher.clone()
    }

    /// Atomic dump for replication force-sync: every live row as CJSON
    /// plus the WAL position the dump corresponds to.
    #[must_use]
    pub fn dump_cjson(&self) -> (Vec<Vec<u8>>, Lsn) {
        let state = self.state.read();
        let items = state
            .items
            .iter()
            .filter(|pv| !pv.is_free())
            .map(|pv| cjson::encode(pv.doc(), &state.tags_matcher))
            .collect();
        (items, state.wal.last_lsn())
    }

    /// Rows of this namespace as JSON, live rows only.
    #[must_use]
    pub fn dump_json(&self) -> Vec<serde_json::Value> {
        let state = self.state.read();
        state
            .items
            .iter()
            .filter(|pv| !pv.is_free())
            .map(|pv| cjson::doc_to_json(pv.doc(), &state.tags_matcher))
            .collect()
    }

    /// Order-insensitive hash of the namespace's live contents; replication
    /// tests compare master and slave with it.
    #[must_use]
    pub fn data_hash(&self) -> u64 {
        let state = self.state.read();
        let mut hash = 0u64;
        for pv in state.items.iter().filter(|pv| !pv.is_free()) {
            let json = cjson::doc_to_json(pv.doc(), &state.tags_matcher);
            hash ^= xxhash_rust::xxh3::xxh3_64(json.to_string().as_bytes());
        }
        hash
    }

    // -----------------------------------------------------------------------
    // WAL access (replication)
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn wal_after(&self, lsn: Lsn) -> Option<Vec<WalRecord>> {
        let state = self.state.read();
        if !state.wal.is_available(lsn) {
            return None;
        }
        Some(state.wal.read_after(lsn))
    }

    /// Apply a staged transaction's step records under one write lock.
    pub fn apply_tx_records(&self, records: &[WalRecord]) -> Result<()> {
        self.check_valid()?;
        let mut state = self.state.write();
        let begin = state.wal.next_lsn();
        for record in records {
            Self::apply_wal_record_under_lock(&mut state, record)?;
            state.repl.last_upstream_lsn = record.lsn;
        }
        for record in state.wal.read_after(Lsn(begin.0 - 1)) {
            self.observers.notify(
                &state.name,
                LsnPair {
                    upstream: record.lsn,
                    origin: record.lsn,
                },
                &record,
            );
        }
        Ok(())
    }

    /// Apply one replicated WAL record; used by the slave consumer.
    pub fn apply_wal_record(&self, record: &WalRecord) -> Result<Lsn> {
        self.check_valid()?;
        let mut state = self.state.write();
        let lsn = Self::apply_wal_record_under_lock(&mut state, record)?;
        state.repl.last_upstream_lsn = record.lsn;
        self.notify(&state, lsn);
        Ok(lsn)
    }

    pub(crate) fn apply_wal_record_under_lock(
        state: &mut NsState,
        record: &WalRecord,
    ) -> Result<Lsn> {
        match record.kind {
            WalRecordKind::ItemInsert
            | WalRecordKind::ItemUpdate
            | WalRecordKind::ItemUpsert => {
                // Re-encode through the local tagsmatcher: unseen tags merge,
                // diverged ids remap.
                let doc = cjson::decode(&record.data, &mut state.tags_matcher)?;
                Ok(Self::modify_doc_under_lock(state, doc, ItemModifyMode::Upsert, 0)?
                    .unwrap_or(state.wal.last_lsn()))
            }
            WalRecordKind::TxStep => {
                let (mode_byte, payload) = record
                    .data
                    .split_first()
                    .ok_or_else(|| MemdexError::UpdateReplication("empty tx step".into()))?;
                let mode = ItemModifyMode::from_byte(*mode_byte);
                let doc = cjson::decode(payload, &mut state.tags_matcher)?;
                Ok(Self::modify_doc_under_lock(state, doc, mode, 0)?
                    .unwrap_or(state.wal.last_lsn()))
            }
            WalRecordKind::ItemDelete => {
                let doc = cjson::decode(&record.data, &mut state.tags_matcher)?;
                Ok(Self::modify_doc_under_lock(state, doc, ItemModifyMode::Delete, 0)?
                    .unwrap_or(state.wal.last_lsn()))
            }
            WalRecordKind::IndexAdd | WalRecordKind::IndexUpdate => {
                let def: IndexDef = serde_json::from_slice(&record.data)
                    .map_err(|e| MemdexError::UpdateReplication(e.to_string()))?;
                if record.kind == WalRecordKind::IndexUpdate {
                    if let Some(pos) = state
                        .indexes
                        .iter()
                        .position(|idx| idx.name().eq_ignore_ascii_case(&def.name))
                    {
                        state.indexes.remove(pos);
                    }
                }
                Self::add_index_under_lock(state, def)?;
                Ok(state.wal.append(record.kind, record.data.clone(), 0))
            }
            WalRecordKind::IndexDrop => {
                let name = String::from_utf8_lossy(&record.data).into_owned();
                if let Some(pos) = state
                    .indexes
                    .iter()
                    .position(|idx| idx.name().eq_ignore_ascii_case(&name))
                {
                    state.indexes.remove(pos);
                }
                Ok(state.wal.append(record.kind, record.data.clone(), 0))
            }
            WalRecordKind::MetaPut => {
                let (key, value): (String, String) = serde_json::from_slice(&record.data)
                    .map_err(|e| MemdexError::UpdateReplication(e.to_string()))?;
                state.meta.insert(key, value);
                Ok(state.wal.append(record.kind, record.data.clone(), 0))
            }
            WalRecordKind::Truncate => {
                state.items.clear();
                state.free.clear();
                let defs: Vec<IndexDef> =
                    state.indexes.iter().map(|idx| idx.def().clone()).collect();
                state.indexes.clear();
                for def in defs {
                    Self::add_index_under_lock(state, def)?;
                }
                Self::bump(state);
                Ok(state.wal.append(record.kind, Vec::new(), 0))
            }
            WalRecordKind::TxBegin | WalRecordKind::TxCommit | WalRecordKind::ForceSync => {
                Ok(state.wal.append(record.kind, record.data.clone(), record.tx_id))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    pub fn put_meta(&self, key: &str, value: &str, ctx: &dyn Cancellation) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();
        state.meta.insert(key.to_owned(), value.to_owned());
        let data = serde_json::to_vec(&(key, value)).map_err(|e| MemdexError::logic(e.to_string()))?;
        if let Some(storage) = &state.storage {
            let mut skey = b"meta:".to_vec();
            skey.extend_from_slice(key.as_bytes());
            storage.write(vec![ChangeRecord::Put {
                key: skey,
                value: value.as_bytes().to_vec(),
            }])?;
        }
        let lsn = state.wal.append(WalRecordKind::MetaPut, data, 0);
        Self::bump(&mut state);
        self.notify(&state, lsn);
        Ok(())
    }

    #[must_use]
    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.state.read().meta.get(key).cloned()
    }

    #[must_use]
    pub fn enum_meta(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().meta.keys().cloned().collect();
        keys.sort();
        keys
    }

    // -----------------------------------------------------------------------
    // Optimization state machine
    // -----------------------------------------------------------------------

    /// Advance the background optimization by one state. Runs under the
    /// write lock, yielding between indexes when a cloner copy is pending.
    pub fn optimization_step(&self) -> OptimizationState {
        if self.check_valid().is_err() {
            return OptimizationState::NotOptimized;
        }
        let mut state = self.state.write();
        match state.optimization_state {
            OptimizationState::NotOptimized => {
                state.optimization_state = OptimizationState::OptimizingIndexes;
            }
            OptimizationState::OptimizingIndexes => {
                // Text and hash structures commit here; nothing is deferred
                // for them today, so the state advances directly.
                state.optimization_state = OptimizationState::OptimizingSortOrders;
            }
            OptimizationState::OptimizingSortOrders => {
                let mut interrupted = false;
                let mut indexes = std::mem::take(&mut state.indexes);
                for index in &mut indexes {
                    if self.cancel_commit.load(Ordering::Acquire) {
                        interrupted = true;
                        break;
                    }
                    index.commit();
                }
                state.indexes = indexes;
                if !interrupted {
                    state.optimization_state = OptimizationState::OptimizationCompleted;
                    state.pending_commits = 0;
                    trace!(ns = %state.name, "sort orders built");
                }
            }
            OptimizationState::OptimizationCompleted => {}
        }
        state.optimization_state
    }

    /// Run the state machine to completion.
    pub fn optimize_now(&self) {
        while self.optimization_step() != OptimizationState::OptimizationCompleted {
            if self.check_valid().is_err() || self.cancel_commit.load(Ordering::Acquire) {
                return;
            }
        }
    }

    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.state.read().pending_commits
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&NsState) -> R) -> R {
        let state = self.state.read();
        f(&state)
    }

    pub(crate) fn flush_storage(&self) -> Result<()> {
        let _guard = self.storage_mtx.lock();
        let state = self.state.read();
        if let Some(storage) = &state.storage {
            storage.flush()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions and query-form writes
    // -----------------------------------------------------------------------

    /// Apply a transaction under the write lock. Steps are validated before
    /// the first WAL append so a failure leaves the namespace untouched.
    pub fn commit_transaction_in_place(
        &self,
        tx: &Transaction,
        ctx: &dyn Cancellation,
    ) -> Result<()> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();

        // Validation pass: parse documents and detect insert conflicts
        // against both the namespace and earlier steps of this transaction.
        let mut prepared: Vec<(Option<DocNode>, &TxStep)> = Vec::with_capacity(tx.steps().len());
        let mut staged_pks: Vec<Variant> = Vec::new();
        let pk_pos = state.indexes.iter().position(|idx| idx.opts().is_pk());
        for step in tx.steps() {
            match step {
                TxStep::Modify { json, mode } => {
                    let value: serde_json::Value = serde_json::from_str(json)
                        .map_err(|e| MemdexError::parse_json(e.to_string()))?;
                    let doc = cjson::doc_from_json(&value, &mut state.tags_matcher);
                    if *mode == ItemModifyMode::Insert {
                        let pk_pos = pk_pos.ok_or_else(|| {
                            MemdexError::params(format!(
                                "namespace '{}' has no PK index",
                                state.name
                            ))
                        })?;
                        let mut pv = PayloadValue::new(state.payload_type.num_fields());
                        pv.set_doc(doc.clone());
                        Self::fill_payload_fields(&state, &mut pv)?;
                        let pk_values = Self::index_values(&state, pk_pos, &pv);
                        let pk = pk_values.first().cloned().ok_or_else(|| {
                            MemdexError::params("item has no value for PK index")
                        })?;
                        if staged_pks.contains(&pk)
                            || Self::find_by_pk(&state, pk_pos, &pk_values)?.is_some()
                        {
                            return Err(MemdexError::exists("item with PK", pk.to_string()));
                        }
                        staged_pks.push(pk);
                    }
                    prepared.push((Some(doc), step));
                }
                TxStep::ModifyQuery { .. } => prepared.push((None, step)),
            }
        }

        let tx_id = state.wal.next_lsn().0 as u64 + 1;
        let begin_lsn = state.wal.append(WalRecordKind::TxBegin, Vec::new(), tx_id);
        for (doc, step) in prepared {
            match (doc, step) {
                (Some(doc), TxStep::Modify { mode, .. }) => {
                    Self::modify_doc_under_lock(&mut state, doc, *mode, tx_id)?;
                }
                (None, TxStep::ModifyQuery { query, delete }) => {
                    let ids = Self::query_row_ids_under_lock(&state, query.clone(), ctx)?;
                    if *delete {
                        Self::delete_rows_under_lock(&mut state, &ids, tx_id)?;
                    } else {
                        Self::update_rows_under_lock(&mut state, &ids, query, tx_id)?;
                    }
                }
                _ => unreachable!("prepared steps keep their shape"),
            }
        }
        state.wal.append(WalRecordKind::TxCommit, Vec::new(), tx_id);
        for record in state.wal.read_after(Lsn(begin_lsn.0 - 1)) {
            self.observers.notify(
                &state.name,
                LsnPair {
                    upstream: record.lsn,
                    origin: record.lsn,
                },
                &record,
            );
        }
        Ok(())
    }

    fn query_row_ids_under_lock(
        state: &NsState,
        query: Query,
        ctx: &dyn Cancellation,
    ) -> Result<Vec<RowId>> {
        let view = NsView {
            name: &state.name,
            payload_type: &state.payload_type,
            tags_matcher: &state.tags_matcher,
            items: &state.items,
            free_count: state.free.len(),
            indexes: &state.indexes,
            sort_orders_built: state.optimization_state == OptimizationState::OptimizationCompleted,
            strict_mode: StrictMode::None,
            query_cache: None,
            generation: state.generation,
        };
        let mut result = QueryResults::new();
        let selector = Selector {
            ns: &view,
            joined: &[],
            cancel: ctx,
        };
        selector.select(query, &mut result)?;
        Ok(result.items.iter().map(|item| item.row_id).collect())
    }

    fn delete_rows_under_lock(state: &mut NsState, ids: &[RowId], tx_id: u64) -> Result<usize> {
        let mut deleted = 0;
        for &row_id in ids {
            let Some(pv) = state.items.get(row_id as usize) else {
                continue;
            };
            if pv.is_free() {
                continue;
            }
            let doc = pv.doc().clone();
            if Self::modify_doc_under_lock(state, doc, ItemModifyMode::Delete, tx_id)?.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn update_rows_under_lock(
        state: &mut NsState,
        ids: &[RowId],
        query: &Query,
        tx_id: u64,
    ) -> Result<usize> {
        let mut updated = 0;
        for &row_id in ids {
            let Some(pv) = state.items.get(row_id as usize) else {
                continue;
            };
            if pv.is_free() {
                continue;
            }
            let mut doc = pv.doc().clone();
            for entry in &query.update_fields {
                let path = state.tags_matcher.path2tag_or_add(&entry.column);
                doc_set(&mut doc, path.as_slice(), &entry.values);
            }
            if Self::modify_doc_under_lock(state, doc, ItemModifyMode::Upsert, tx_id)?.is_some() {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Query-form `DELETE`; returns the number of removed rows.
    pub fn delete_by_query(&self, query: Query, ctx: &dyn Cancellation) -> Result<usize> {
        self.check_valid()?;
        ctx.check()?;
        let mut state = self.state.write();
        let ids = Self::query_row_ids_under_lock(&state, query, ctx)?;
        let begin = state.wal.next_lsn();
        let deleted = Self::delete_rows_under_lock(&mut state, &ids, 0)?;
        for record in state.wal.read_after(Lsn(begin.0 - 1)) {
            self.observers.notify(
                &state.name,
                LsnPair {
                    upstream: record.lsn,
                    origin: record.lsn,
                },
                &record,
            );
        }
        Ok(deleted)
    }

    /// Query-form `UPDATE`; returns the number of touched rows.
    pub fn update_by_query(&self, query: Query, ctx: &dyn Cancellation) -> Result<usize> {
        self.check_valid()?;
        ctx.check()?;
        if query.update_fields.is_empty() {
            return Err(MemdexError::params("update query has no field assignments"));
        }
        let mut state = self.state.write();
        let ids = Self::query_row_ids_under_lock(&state, query.clone(), ctx)?;
        let begin = state.wal.next_lsn();
        let updated = Self::update_rows_under_lock(&mut state, &ids, &query, 0)?;
        for record in state.wal.read_after(Lsn(begin.0 - 1)) {
            self.observers.notify(
                &state.name,
                LsnPair {
                    upstream: record.lsn,
                    origin: record.lsn,
                },
                &record,
            );
        }
        Ok(updated)
    }
}

/// Set a path in a document tree to the given scalar value(s), creating
/// intermediate objects as needed.
fn doc_set(doc: &mut DocNode, path: &[u32], values: &[Variant]) {
    let Some((&tag, rest)) = path.split_first() else {
        *doc = match values {
            [] => DocNode::Scalar(Variant::Null),
            [single] => DocNode::Scalar(single.clone()),
            many => DocNode::Array(
                many.iter()
                    .map(|v| DocNode::Scalar(v.clone()))
                    .collect(),
            ),
        };
        return;
    };
    if !matches!(doc, DocNode::Object(_)) {
        *doc = DocNode::Object(Vec::new());
    }
    let DocNode::Object(members) = doc else {
        unreachable!("coerced to object above");
    };
    if let Some((_, child)) = members.iter_mut().find(|(t, _)| *t == tag) {
        doc_set(child, rest, values);
    } else {
        let mut child = DocNode::Object(Vec::new());
        doc_set(&mut child, rest, values);
        members.push((tag, child));
    }
}
