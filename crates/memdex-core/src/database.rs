use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use memdex_error::{MemdexError, Result};
use memdex_index::IndexDef;
use memdex_query::Query;
use memdex_select::QueryResults;
use parking_lot::RwLock;
use tracing::debug;

use crate::cloner::NsCloner;
use crate::context::MemdexContext;
use crate::namespace::{
    ItemModifyMode, JoinPreparedData, Namespace, NamespaceConfig, OPTIMIZATION_COMMITS_THRESHOLD,
};
use crate::observer::{ObserverRegistry, UpdatesFilters, UpdatesObserver};
use crate::storage::{MemStorage, Storage};
use crate::transaction::Transaction;

/// Storage options for `open_namespace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageOpts {
    pub enabled: bool,
}

impl StorageOpts {
    #[must_use]
    pub const fn enabled() -> Self {
        Self { enabled: true }
    }
}

struct Inner {
    namespaces: RwLock<HashMap<String, Arc<NsCloner>>>,
    observers: Arc<ObserverRegistry>,
    ns_config: NamespaceConfig,
    stop_optimizer: AtomicBool,
}

/// The in-process database handle. Cheap to clone; all clones share the
/// same namespaces.
#[derive(Clone)]
pub struct Memdex {
    inner: Arc<Inner>,
}

impl Default for Memdex {
    fn default() -> Self {
        Self::new()
    }
}

impl Memdex {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(NamespaceConfig::default())
    }

    #[must_use]
    pub fn with_config(ns_config: NamespaceConfig) -> Self {
        let inner = Arc::new(Inner {
            namespaces: RwLock::new(HashMap::new()),
            observers: Arc::new(ObserverRegistry::new()),
            ns_config,
            stop_optimizer: AtomicBool::new(false),
        });
        Self::spawn_optimizer(&inner);
        Self { inner }
    }

    /// Background worker advancing each namespace's optimization state
    /// machine once mutations accrue.
    fn spawn_optimizer(inner: &Arc<Inner>) {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        std::thread::Builder::new()
            .name("memdex-optimizer".to_owned())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(20));
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.stop_optimizer.load(Ordering::Acquire) {
                    return;
                }
                let cloners: Vec<Arc<NsCloner>> =
                    inner.namespaces.read().values().cloned().collect();
                for cloner in cloners {
                    let ns = cloner.load();
                    if ns.pending_commits() > OPTIMIZATION_COMMITS_THRESHOLD {
                        ns.optimize_now();
                    }
                }
            })
            .expect("spawn optimizer thread");
    }

    // -----------------------------------------------------------------------
    // Namespace lifecycle
    // -----------------------------------------------------------------------

    pub fn open_namespace(
        &self,
        name: &str,
        storage_opts: StorageOpts,
        _ctx: &MemdexContext,
    ) -> Result<()> {
        crate::storage::validate_storage_name(name)?;
        let key = name.to_lowercase();
        let mut namespaces = self.inner.namespaces.write();
        if namespaces.contains_key(&key) {
            return Ok(());
        }
        let storage: Option<Arc<dyn Storage>> = if storage_opts.enabled {
            Some(Arc::new(MemStorage::new()))
        } else {
            None
        };
        let ns = Namespace::new(
            name,
            self.inner.ns_config.clone(),
            storage,
            Arc::clone(&self.inner.observers),
        )?;
        namespaces.insert(key, NsCloner::new(ns));
        debug!(ns = name, "namespace opened");
        Ok(())
    }

    pub fn close_namespace(&self, name: &str, _ctx: &MemdexContext) -> Result<()> {
        self.inner
            .namespaces
            .write()
            .remove(&name.to_lowercase())
            .map(|_| ())
            .ok_or_else(|| MemdexError::not_found("namespace", name))
    }

    pub fn drop_namespace(&self, name: &str, _ctx: &MemdexContext) -> Result<()> {
        let cloner = self
            .inner
            .namespaces
            .write()
            .remove(&name.to_lowercase())
            .ok_or_else(|| MemdexError::not_found("namespace", name))?;
        let ns = cloner.load();
        ns.with_state(|state| {
            if let Some(storage) = &state.storage {
                let _ = storage.destroy();
            }
        });
        ns.invalidate();
        debug!(ns = name, "namespace dropped");
        Ok(())
    }

    pub fn truncate_namespace(&self, name: &str, ctx: &MemdexContext) -> Result<()> {
        self.cloner(name)?.with_ns(|ns| ns.truncate(ctx))
    }

    /// Rename `src` to `dst`, replacing `dst` when it exists.
    pub fn rename_namespace(&self, src: &str, dst: &str, _ctx: &MemdexContext) -> Result<()> {
        crate::storage::validate_storage_name(dst)?;
        let src_key = src.to_lowercase();
        let dst_key = dst.to_lowercase();
        if src_key == dst_key {
            return Ok(());
        }
        let mut namespaces = self.inner.namespaces.write();
        let cloner = namespaces
            .remove(&src_key)
            .ok_or_else(|| MemdexError::not_found("namespace", src))?;
        let target = namespaces.remove(&dst_key);
        cloner.rename(target.as_ref(), dst)?;
        namespaces.insert(dst_key, cloner);
        Ok(())
    }

    /// Namespace names, optionally filtered by a case-insensitive substring.
    #[must_use]
    pub fn enum_namespaces(&self, filter: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .namespaces
            .read()
            .values()
            .map(|cloner| cloner.load().name())
            .filter(|name| {
                filter.map_or(true, |f| name.to_lowercase().contains(&f.to_lowercase()))
            })
            .collect();
        names.sort();
        names
    }

    pub(crate) fn cloner(&self, name: &str) -> Result<Arc<NsCloner>> {
        self.inner
            .namespaces
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| MemdexError::not_found("namespace", name))
    }

    /// Low-level handle to a namespace's cloner wrapper, for replication
    /// and diagnostics.
    pub fn ns_handle(&self, name: &str) -> Result<Arc<NsCloner>> {
        self.cloner(name)
    }

    // -----------------------------------------------------------------------
    // Index lifecycle
    // -----------------------------------------------------------------------

    pub fn add_index(&self, ns: &str, def: IndexDef, ctx: &MemdexContext) -> Result<()> {
        self.cloner(ns)?.with_ns(|ns| ns.add_index(def.clone(), ctx))
    }

    pub fn update_index(&self, ns: &str, def: IndexDef, ctx: &MemdexContext) -> Result<()> {
        self.cloner(ns)?
            .with_ns(|ns| ns.update_index(def.clone(), ctx))
    }

    pub fn drop_index(&self, ns: &str, name: &str, ctx: &MemdexContext) -> Result<()> {
        self.cloner(ns)?.with_ns(|ns| ns.drop_index(name, ctx))
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    pub fn insert(&self, ns: &str, json: &str, ctx: &MemdexContext) -> Result<()> {
        self.modify(ns, json, ItemModifyMode::Insert, ctx)
    }

    pub fn update(&self, ns: &str, json: &str, ctx: &MemdexContext) -> Result<()> {
        self.modify(ns, json, ItemModifyMode::Update, ctx)
    }

    pub fn upsert(&self, ns: &str, json: &str, ctx: &MemdexContext) -> Result<()> {
        self.modify(ns, json, ItemModifyMode::Upsert, ctx)
    }

    pub fn delete(&self, ns: &str, json: &str, ctx: &MemdexContext) -> Result<()> {
        self.modify(ns, json, ItemModifyMode::Delete, ctx)
    }

    fn modify(&self, ns: &str, json: &str, mode: ItemModifyMode, ctx: &MemdexContext) -> Result<()> {
        self.cloner(ns)?
            .with_ns(|ns| ns.modify_json(json, mode, ctx))
    }

    /// Query-form `DELETE`; returns the number of removed rows.
    pub fn delete_by_query(&self, query: Query, ctx: &MemdexContext) -> Result<usize> {
        self.cloner(&query.namespace)?
            .with_ns(|ns| ns.delete_by_query(query.clone(), ctx))
    }

    /// Query-form `UPDATE`; returns the number of touched rows.
    pub fn update_by_query(&self, query: Query, ctx: &MemdexContext) -> Result<usize> {
        self.cloner(&query.namespace)?
            .with_ns(|ns| ns.update_by_query(query.clone(), ctx))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn select(&self, query: &Query, ctx: &MemdexContext) -> Result<QueryResults> {
        if !query.merge_queries.is_empty() && !query.sorting_entries.is_empty() {
            return Err(MemdexError::logic(
                "sorting cannot be applied to merged queries",
            ));
        }
        let mut result = QueryResults::new();
        self.select_into(query, ctx, &mut result)?;
        for merged in &query.merge_queries {
            let before = result.items.len();
            self.select_into(merged, ctx, &mut result)?;
            let ns_idx = (result.namespaces.len() - 1) as u8;
            for item in &mut result.items[before..] {
                item.ns_id = ns_idx;
            }
        }
        Ok(result)
    }

    pub fn select_sql(&self, sql: &str, ctx: &MemdexContext) -> Result<QueryResults> {
        let query = memdex_parser::parse_sql(sql)?;
        self.select(&query, ctx)
    }

    /// Completion candidates for interactive SQL input.
    #[must_use]
    pub fn sql_suggestions(&self, sql: &str, pos: usize) -> Vec<String> {
        let mut extra = self.enum_namespaces(None);
        for cloner in self.inner.namespaces.read().values() {
            for def in cloner.load().index_defs() {
                extra.push(def.name);
            }
        }
        memdex_parser::suggestions(sql, pos, &extra)
    }

    fn select_into(
        &self,
        query: &Query,
        ctx: &MemdexContext,
        result: &mut QueryResults,
    ) -> Result<()> {
        let cloner = self.cloner(&query.namespace)?;
        let mut staging: Option<QueryResults> = None;
        cloner.with_ns(|ns| {
            let joins = self.prepare_joins(query, ctx)?;
            let mut tmp = QueryResults::new();
            let mut q = query.clone();
            q.merge_queries.clear();
            ns.select(q, joins, ctx, &mut tmp)?;
            staging = Some(tmp);
            Ok(())
        })?;
        let tmp = staging.expect("select succeeded");
        merge_results(result, tmp);
        Ok(())
    }

    fn prepare_joins(&self, query: &Query, ctx: &MemdexContext) -> Result<Vec<JoinPreparedData>> {
        query
            .join_queries
            .iter()
            .enumerate()
            .map(|(i, joined)| {
                let right = self.cloner(&joined.query.namespace)?;
                let mut staging = None;
                right.with_ns(|rns| {
                    let mut tmp = QueryResults::new();
                    rns.select(joined.query.clone(), Vec::new(), ctx, &mut tmp)?;
                    staging = Some(tmp);
                    Ok(())
                })?;
                let right_result = staging.expect("join select succeeded");
                let right_ns = right.load();
                Ok(JoinPreparedData {
                    join_type: joined.join_type,
                    right_ns: joined.query.namespace.clone(),
                    on: joined.on.clone(),
                    right_payload_type: right_ns.payload_type(),
                    right_tags_matcher: right_ns.tags_matcher(),
                    values: right_result
                        .items
                        .into_iter()
                        .filter_map(|item| item.value.map(|v| (item.row_id, v)))
                        .collect(),
                    ns_id: (i + 1) as u8,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn new_transaction(&self, ns: &str) -> Result<Transaction> {
        self.cloner(ns)?;
        Ok(Transaction::new(ns))
    }

    /// Commit a transaction; large transactions run on a shadow copy of the
    /// namespace.
    pub fn commit_transaction(&self, tx: &mut Transaction, ctx: &MemdexContext) -> Result<()> {
        let cloner = self.cloner(tx.namespace())?;
        cloner.commit_transaction(tx, ctx)?;
        tx.finish();
        Ok(())
    }

    /// Discard a transaction without applying anything.
    pub fn rollback_transaction(&self, mut tx: Transaction) {
        tx.finish();
    }

    // -----------------------------------------------------------------------
    // Meta and subscriptions
    // -----------------------------------------------------------------------

    pub fn put_meta(&self, ns: &str, key: &str, value: &str, ctx: &MemdexContext) -> Result<()> {
        self.cloner(ns)?.with_ns(|ns| ns.put_meta(key, value, ctx))
    }

    pub fn get_meta(&self, ns: &str, key: &str) -> Result<Option<String>> {
        self.cloner(ns)?.with_ns(|ns| Ok(ns.get_meta(key)))
    }

    pub fn enum_meta(&self, ns: &str) -> Result<Vec<String>> {
        self.cloner(ns)?.with_ns(|ns| Ok(ns.enum_meta()))
    }

    pub fn subscribe_updates(&self, observer: Arc<dyn UpdatesObserver>, filters: UpdatesFilters) {
        self.inner.observers.subscribe(observer, filters);
    }

    pub fn unsubscribe_updates(&self, observer: &Arc<dyn UpdatesObserver>) {
        self.inner.observers.unsubscribe(observer);
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Run a namespace's optimization state machine to completion.
    pub fn optimize_namespace(&self, name: &str) -> Result<()> {
        self.cloner(name)?.with_ns(|ns| {
            ns.optimize_now();
            Ok(())
        })
    }

    pub fn shutdown(&self) {
        self.inner.stop_optimizer.store(true, Ordering::Release);
    }
}

fn merge_results(into: &mut QueryResults, from: QueryResults) {
    into.total_count += from.total_count;
    into.have_rank |= from.have_rank;
    into.need_output_rank |= from.need_output_rank;
    into.items.extend(from.items);
    into.joined.extend(from.joined);
    into.aggregation_results.extend(from.aggregation_results);
    into.namespaces.extend(from.namespaces);
    if into.explain.is_none() {
        into.explain = from.explain;
    }
}

/// Registry of named databases, for embedders hosting several.
#[derive(Default)]
pub struct DatabaseRegistry {
    databases: RwLock<HashMap<String, Memdex>>,
}

impl DatabaseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> Result<Memdex> {
        crate::storage::validate_storage_name(name)?;
        let mut databases = self.databases.write();
        Ok(databases
            .entry(name.to_owned())
            .or_insert_with(Memdex::new)
            .clone())
    }

    #[must_use]
    pub fn enum_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }
}
