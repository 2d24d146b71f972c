use memdex_error::{MemdexError, Result};
use memdex_index::{Comparator, ComparatorField, SelectKeyResult, SelectOpts};
use memdex_query::{
    AggType, CalcTotalMode, CondType, OpType, Query, SortExpression, StrictMode,
};
use memdex_types::{ConstPayload, ItemRef, RowId, SET_BY_JSON_PATH};
use tracing::{debug, trace, warn};

use crate::aggregator::{Aggregator, FacetSortKey};
use crate::container::SelectIteratorContainer;
use crate::crashquery::QueryDebugGuard;
use crate::iterator::{IterOrder, SelectIterator};
use crate::joins::JoinedSelector;
use crate::nsview::NsView;
use crate::preprocessor::QueryPreprocessor;
use crate::results::{NsContext, QueryResults};
use crate::sorting::{
    apply_forced_sort, apply_general_sort, set_limit_and_offset, ItemComparator, ResolvedSortEntry,
    SortKind, SortingContext,
};
use crate::Cancellation;

/// Warn once per this many rows when a result set grows absurdly large.
const RESULT_SIZE_WARN_STEP: usize = 10_000_000;
/// Cancellation is polled once per this many candidate rows.
const CANCEL_CHECK_STEP: usize = 1024;

/// Executes one prepared query against one read-locked namespace.
pub struct Selector<'a> {
    pub ns: &'a NsView<'a>,
    pub joined: &'a [JoinedSelector<'a>],
    pub cancel: &'a dyn Cancellation,
}

impl Selector<'_> {
    /// Run the query, appending to `result`.
    pub fn select(&self, mut query: Query, result: &mut QueryResults) -> Result<()> {
        let optimization_state = if self.ns.sort_orders_built {
            "optimization-completed"
        } else {
            "not-optimized"
        };
        let _guard = QueryDebugGuard::new(&query.to_string(), self.ns.name, optimization_state);
        self.cancel.check()?;

        if query.entries.open_brackets() != 0 {
            return Err(MemdexError::logic("query has unclosed brackets"));
        }

        // --- aggregators ------------------------------------------------
        let mut aggregators = self.build_aggregators(&query)?;
        let aggregations_only = aggregators.len() > 1
            || (aggregators.len() == 1 && aggregators[0].agg_type() != AggType::Distinct);
        QueryPreprocessor::add_distinct_entries(&mut query);

        // --- preprocessing ----------------------------------------------
        QueryPreprocessor::lookup_query_indexes(&mut query, self.ns)?;
        let is_ft = QueryPreprocessor::contains_fulltext(&query, self.ns);
        if !is_ft {
            QueryPreprocessor::substitute_composite_indexes(&mut query, self.ns)?;
        }
        QueryPreprocessor::convert_where_values(&mut query, self.ns)?;

        // --- cached total -----------------------------------------------
        let mut need_calc_total = query.calc_total == CalcTotalMode::AccurateTotal;
        let mut need_put_cached_total = false;
        let signature = query.cache_signature();
        if query.calc_total == CalcTotalMode::CachedTotal {
            match self
                .ns
                .query_cache
                .and_then(|cache| cache.get(&signature, self.ns.generation))
            {
                Some(total) => {
                    trace!(ns = self.ns.name, total, "using total count from query cache");
                    result.total_count = total;
                }
                None => {
                    trace!(ns = self.ns.name, "total count will be calculated by query");
                    need_calc_total = true;
                    need_put_cached_total = true;
                }
            }
        }

        // --- sorting ----------------------------------------------------
        let disable_optimized_sort = is_ft
            || !query.sorting_entries.is_empty()
            || !query.forced_sort_order.is_empty();
        let sort_by = if disable_optimized_sort {
            query.sorting_entries.clone()
        } else {
            QueryPreprocessor::detect_optimal_sort_order(&query, self.ns)
                .into_iter()
                .collect()
        };
        let mut sorting_ctx = self.prepare_sorting_context(&sort_by, &query, is_ft)?;

        if sorting_ctx.is_optimization_enabled() {
            let first_is_not = !query.entries.is_empty() && query.entries.op(0) == OpType::Not;
            if is_ft || first_is_not || !self.is_sort_optimization_effective(&query, &sorting_ctx) {
                sorting_ctx.reset_optimization();
            }
        }

        // --- iterator container -----------------------------------------
        let mut container = SelectIteratorContainer::new();
        self.build_iterators(&query, is_ft, &mut container, result)?;

        // A scan can only drive index order when nothing else produces ids.
        if container.has_idsets() {
            sorting_ctx.index_ordered_first = false;
            sorting_ctx.reset_optimization();
        }

        let items_count = self.ns.items.len();
        let mut max_iterations = usize::MAX;
        container.for_each_iterator(|it| {
            if it.comparators.is_empty() && it.has_idsets() {
                max_iterations = max_iterations.min(it.get_max_iterations(usize::MAX));
            }
        });

        if !is_ft && !container.has_idsets() {
            let scan = if let Some(idx_pos) = sorting_ctx.uncommitted_index {
                max_iterations = items_count;
                SelectIterator::scan_ordered(self.ns.indexes[idx_pos].ordered_ids(), "-scan")
            } else if sorting_ctx.index_ordered_first {
                let entry = &sort_by[0];
                let idx_pos = self
                    .ns
                    .index_by_name(&entry.expression)
                    .expect("ordered-first entry was resolved");
                let orders = self.ns.indexes[idx_pos].sort_orders().to_vec();
                max_iterations = orders.len().max(items_count);
                let mut scan = SelectIterator::scan_ordered(orders, "-scan");
                // Rows inserted after the last sort-orders build are missing
                // from the permutation; walk them afterwards.
                if self.ns.indexes[idx_pos].sort_orders().len() < items_count {
                    scan = SelectIterator::scan(items_count as RowId);
                    sorting_ctx.index_ordered_first = false;
                }
                scan
            } else {
                max_iterations = items_count;
                SelectIterator::scan(items_count as RowId)
            };
            container.append_front(OpType::And, scan);
        }
        if max_iterations == usize::MAX {
            max_iterations = items_count;
        }

        container.sort_by_cost(max_iterations);
        container.check_first_query(items_count as RowId);

        let reverse = !is_ft
            && (sorting_ctx.index_ordered_first || sorting_ctx.is_optimization_enabled())
            && sort_by.first().is_some_and(|e| e.desc);

        container.for_each_iterator_mut(|it| it.start(reverse));

        if is_ft {
            result.have_rank = true;
        }
        if query.with_rank {
            if is_ft {
                result.need_output_rank = true;
            } else {
                return Err(MemdexError::logic(
                    "rank() is available only for fulltext query",
                ));
            }
        }

        // --- main loop --------------------------------------------------
        let force_all = sorting_ctx.post_loop_sorting_required() && !aggregations_only;
        let mut start = if force_all { 0 } else { query.start };
        let mut count = if force_all { usize::MAX } else { query.count };
        let mut matched_any = false;
        let mut scanned = 0usize;

        let left_fields = self.resolve_join_left_fields();
        let result_init_size = result.items.len();

        loop {
            let Some(lead) = container.leading_iterator_mut() else {
                break;
            };
            if !lead.next() {
                break;
            }
            let row_id = lead.val();
            scanned += 1;
            if scanned % CANCEL_CHECK_STEP == 0 {
                self.cancel.check()?;
            }
            let Some(pv) = self.ns.items.get(row_id as usize) else {
                continue;
            };
            if pv.is_free() {
                continue;
            }
            let pl = ConstPayload::new(self.ns.payload_type, pv);
            let joined = self.joined;
            let tm = self.ns.tags_matcher;
            let mut join_matcher = |join_idx: usize, _row: RowId, pl: &ConstPayload<'_>| {
                let selector = joined.get(join_idx).ok_or_else(|| {
                    MemdexError::logic(format!("join #{join_idx} has no prepared selector"))
                })?;
                selector.matches(pl, tm, &left_fields[join_idx])
            };
            if !container.process(&pl, row_id, tm, &mut join_matcher)? {
                continue;
            }
            if !query.equal_positions.is_empty()
                && !self.equal_positions_hold(&query, &pl)?
            {
                continue;
            }
            matched_any = true;
            container.exclude_distinct(&pl, tm)?;
            let rank = container
                .leading_iterator()
                .map_or(0, |it| it.rank(row_id));

            if start > 0 {
                start -= 1;
            } else if count > 0 {
                for aggregator in &mut aggregators {
                    aggregator.aggregate(&pl, tm)?;
                }
                if !aggregations_only {
                    result.items.push(ItemRef::new(row_id, rank, 0));
                    let size = result.items.len();
                    if size >= RESULT_SIZE_WARN_STEP && size % RESULT_SIZE_WARN_STEP == 0 {
                        warn!(
                            ns = self.ns.name,
                            count = size,
                            query = %query,
                            "too big query results"
                        );
                    }
                }
                if count != usize::MAX {
                    count -= 1;
                }
            }
            if need_calc_total {
                result.total_count += 1;
            }
            if count == 0 && !need_calc_total {
                break;
            }
        }
        if !matched_any {
            trace!(ns = self.ns.name, "no rows matched");
        }

        // --- post-loop sorting and paging -------------------------------
        if force_all {
            let comparator = ItemComparator {
                ns: self.ns,
                ctx: &sorting_ctx,
                joined: self.joined,
                joined_left_fields: &left_fields,
            };
            if sorting_ctx.forced_mode {
                let mut items = std::mem::take(&mut result.items);
                let range = apply_forced_sort(&mut items, &query, self.ns, &comparator)?;
                apply_general_sort(&mut items, range, &comparator, false);
                result.items = items;
            } else {
                let len = result.items.len();
                apply_general_sort(&mut result.items, result_init_size..len, &comparator, false);
            }
            set_limit_and_offset(&mut result.items, query.start, query.count);
        }

        // --- joins attachment -------------------------------------------
        if !self.joined.is_empty() {
            while result.joined.len() < self.joined.len() {
                result.joined.push(Default::default());
            }
            for item in &result.items[result_init_size.min(result.items.len())..] {
                let pv = &self.ns.items[item.row_id as usize];
                let pl = ConstPayload::new(self.ns.payload_type, pv);
                for (join_idx, selector) in self.joined.iter().enumerate() {
                    let rows = selector.matching_rows(&pl, self.ns.tags_matcher, &left_fields[join_idx])?;
                    if !rows.is_empty() {
                        result.joined[join_idx].insert(item.row_id, rows);
                    }
                }
            }
        }

        // --- finalize ---------------------------------------------------
        for item in &mut result.items {
            if item.value.is_none() {
                item.value = Some(self.ns.items[item.row_id as usize].clone());
            }
        }
        for aggregator in aggregators {
            result.aggregation_results.push(aggregator.result());
        }
        if need_put_cached_total {
            if let Some(cache) = self.ns.query_cache {
                trace!(
                    ns = self.ns.name,
                    total = result.total_count,
                    "put total count into query cache"
                );
                cache.put(&signature, self.ns.generation, result.total_count);
            }
        }
        result.namespaces.push(NsContext {
            payload_type: self.ns.payload_type.clone(),
            tags_matcher: self.ns.tags_matcher.clone(),
            select_filter: query.select_filter.clone(),
        });
        if query.explain {
            result.explain = Some(self.explain_json(&container, &sorting_ctx, max_iterations, result));
        }
        debug!(
            ns = self.ns.name,
            matched = result.items.len(),
            scanned,
            "select done"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Iterator construction
    // -----------------------------------------------------------------------

    fn build_iterators(
        &self,
        query: &Query,
        is_ft: bool,
        container: &mut SelectIteratorContainer,
        result: &mut QueryResults,
    ) -> Result<()> {
        let entries = &query.entries;
        let opts = SelectOpts {
            items_count: self.ns.items.len(),
            ..SelectOpts::default()
        };
        let mut i = 0usize;
        // Walk the flat tree, mirroring its bracket structure.
        let mut spans: Vec<usize> = Vec::new();
        while i < entries.len() || !spans.is_empty() {
            while let Some(&end) = spans.last() {
                if i == end {
                    container.close_bracket();
                    spans.pop();
                } else {
                    break;
                }
            }
            if i >= entries.len() {
                break;
            }
            let op = entries.op(i);
            if !entries.is_leaf(i) {
                container.open_bracket(op);
                spans.push(entries.next(i));
                i += 1;
                continue;
            }
            let entry = entries.leaf(i).expect("leaf");
            if entry.is_join() {
                let join_idx = entry.join_index as usize;
                container.append(op, self.join_iterator(join_idx, op)?);
            } else if entry.distinct {
                let mut it = SelectIterator::new(SelectKeyResult::default(), &entry.index);
                it.distinct = true;
                it.distinct_field = Some(self.field_of(&entry.index));
                container.append(op, it);
            } else if entry.idx_no == SET_BY_JSON_PATH {
                let comparator = Comparator::new(
                    ComparatorField::JsonPath(entry.index.clone()),
                    entry.condition,
                    entry.values.clone(),
                    Default::default(),
                );
                container.append(
                    op,
                    SelectIterator::new(SelectKeyResult::from_comparator(comparator), &entry.index),
                );
            } else {
                let index = &self.ns.indexes[entry.idx_no as usize];
                let results = index
                    .select_key(&entry.values, entry.condition, 0, &opts)
                    .map_err(|err| match err {
                        MemdexError::QueryExec(_) | MemdexError::Params(_) => err,
                        other => MemdexError::query_exec(other.to_string()),
                    })?;
                let mut merged = SelectKeyResult::default();
                for r in results {
                    merged.idsets.extend(r.idsets);
                    merged.comparators.extend(r.comparators);
                    merged.ranks.extend(r.ranks);
                }
                let mut it = SelectIterator::new(merged, index.name());
                if index.is_fulltext() {
                    it.order = IterOrder::ForcedFirst;
                    result.have_rank = true;
                }
                container.append(op, it);
            }
            i = entries.next(i);
        }
        let _ = is_ft;
        Ok(())
    }

    /// Build the iterator standing for an inner-join placeholder. A single
    /// equality ON condition over an indexed left field turns into an
    /// id-set lookup; everything else evaluates per row.
    fn join_iterator(&self, join_idx: usize, _op: OpType) -> Result<SelectIterator> {
        let selector = self
            .joined
            .get(join_idx)
            .ok_or_else(|| MemdexError::logic(format!("join #{join_idx} without selector")))?;
        if selector.on.len() == 1 && selector.on[0].condition == CondType::Eq {
            let on = &selector.on[0];
            if let Some(idx_pos) = self.ns.index_by_name(&on.left_field) {
                let keys = selector.right_field_values(&on.right_field)?;
                if !keys.is_empty() {
                    let opts = SelectOpts {
                        items_count: self.ns.items.len(),
                        ..SelectOpts::default()
                    };
                    let results = self.ns.indexes[idx_pos].select_key(
                        &keys.into_iter().collect(),
                        CondType::Set,
                        0,
                        &opts,
                    )?;
                    let mut merged = SelectKeyResult::default();
                    for r in results {
                        merged.idsets.extend(r.idsets);
                        merged.comparators.extend(r.comparators);
                    }
                    if !merged.idsets.is_empty() && merged.comparators.is_empty() {
                        let mut it = SelectIterator::new(
                            merged,
                            format!("{} ON {}", selector.right_ns, on.left_field),
                        );
                        it.join_index = None;
                        return Ok(it);
                    }
                }
            }
        }
        let mut it = SelectIterator::new(SelectKeyResult::default(), &selector.right_ns);
        it.join_index = Some(join_idx);
        Ok(it)
    }

    fn field_of(&self, name: &str) -> ComparatorField {
        match self
            .ns
            .index_by_name(name)
            .and_then(|pos| self.ns.indexes[pos].fields().iter().find(|&f| f >= 0))
        {
            Some(field) => ComparatorField::Index(field as usize),
            None => match self.ns.payload_type.field_by_name(name) {
                Some(field) => ComparatorField::Index(field),
                None => ComparatorField::JsonPath(name.to_owned()),
            },
        }
    }

    /// `equal_position(f1, f2, ...)`: the row matches only when there is an
    /// array position at which every named field satisfies its own where
    /// condition.
    fn equal_positions_hold(&self, query: &Query, pl: &ConstPayload<'_>) -> Result<bool> {
        for group in &query.equal_positions {
            // Collect (field values, condition comparator) per group member.
            let mut columns = Vec::with_capacity(group.len());
            let mut found_all = true;
            for name in group {
                let mut comparator = None;
                query.entries.for_each_leaf(|entry, _| {
                    if comparator.is_none() && entry.index.eq_ignore_ascii_case(name) {
                        comparator = Some(Comparator::new(
                            ComparatorField::Index(0),
                            entry.condition,
                            entry.values.clone(),
                            Default::default(),
                        ));
                    }
                });
                let Some(comparator) = comparator else {
                    found_all = false;
                    break;
                };
                let values = match self.field_of(name) {
                    ComparatorField::Index(field) => pl.get(field),
                    ComparatorField::JsonPath(path) => pl.get_by_json_path(
                        &path,
                        self.ns.tags_matcher,
                        memdex_types::KeyValueKind::Undefined,
                    )?,
                    ComparatorField::TagsPath(path) => pl.get_by_tags_path(&path),
                    ComparatorField::Composite(_) => Default::default(),
                };
                columns.push((values, comparator));
            }
            if !found_all {
                continue;
            }
            let positions = columns.iter().map(|(v, _)| v.len()).min().unwrap_or(0);
            let mut any_position = false;
            for p in 0..positions {
                let mut all = true;
                for (values, comparator) in &columns {
                    let single: memdex_types::VariantArray =
                        smallvec::smallvec![values[p].clone()];
                    if !comparator.match_values(&single)? {
                        all = false;
                        break;
                    }
                }
                if all {
                    any_position = true;
                    break;
                }
            }
            if !any_position {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn resolve_join_left_fields(&self) -> Vec<Vec<Option<usize>>> {
        self.joined
            .iter()
            .map(|selector| {
                selector
                    .on
                    .iter()
                    .map(|entry| self.ns.payload_type.field_by_name(&entry.left_field))
                    .collect()
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Sorting context
    // -----------------------------------------------------------------------

    fn prepare_sorting_context(
        &self,
        sort_by: &[memdex_query::SortingEntry],
        query: &Query,
        is_ft: bool,
    ) -> Result<SortingContext> {
        let mut ctx = SortingContext {
            forced_mode: !query.forced_sort_order.is_empty(),
            ..SortingContext::default()
        };
        let joined_names: Vec<&str> = query
            .join_queries
            .iter()
            .map(|j| j.query.namespace.as_str())
            .collect();
        let strict = if query.strict_mode == StrictMode::NotSet {
            self.ns.strict_mode
        } else {
            query.strict_mode
        };

        for (i, sorting_entry) in sort_by.iter().enumerate() {
            let expr = SortExpression::parse(&sorting_entry.expression, &joined_names)?;
            let kind = if let Some(field_name) = expr.index_field() {
                match self.ns.index_by_name(field_name) {
                    Some(idx_pos) => {
                        let index = &self.ns.indexes[idx_pos];
                        if i == 0 && index.is_ordered() && !is_ft {
                            if self.ns.sort_orders_built && index.sort_orders_built() {
                                ctx.index_ordered_first = true;
                            } else {
                                ctx.uncommitted_index = Some(idx_pos);
                            }
                        }
                        let field = index
                            .fields()
                            .iter()
                            .find(|&f| f >= 0)
                            .map(|f| f as usize);
                        match field {
                            Some(field) if !index.opts().is_sparse() => SortKind::Index {
                                field,
                                collate: index.collate().clone(),
                            },
                            _ => SortKind::JsonPath {
                                path: field_name.to_owned(),
                            },
                        }
                    }
                    None => {
                        self.validate_sort_field(field_name, strict)?;
                        match self.ns.payload_type.field_by_name(field_name) {
                            Some(field) => SortKind::Index {
                                field,
                                collate: Default::default(),
                            },
                            None => SortKind::JsonPath {
                                path: field_name.to_owned(),
                            },
                        }
                    }
                }
            } else {
                if !query.merge_queries.is_empty() {
                    return Err(MemdexError::logic(
                        "sorting by expression cannot be applied to merged queries",
                    ));
                }
                if expr.contains_rank() && !is_ft {
                    return Err(MemdexError::logic(
                        "sort by rank() is available only for fulltext query",
                    ));
                }
                SortKind::Expression { expr }
            };
            ctx.entries.push(ResolvedSortEntry {
                expression_text: sorting_entry.expression.clone(),
                desc: sorting_entry.desc,
                kind,
            });
        }
        Ok(ctx)
    }

    fn validate_sort_field(&self, name: &str, strict: StrictMode) -> Result<()> {
        match strict {
            StrictMode::Indexes => Err(MemdexError::params(format!(
                "current strict mode allows sort by index fields only; there is no index \
                 '{name}' in namespace '{}'",
                self.ns.name
            ))),
            StrictMode::Names => {
                if self.ns.tags_matcher.path2tag(name).is_empty()
                    && self.ns.payload_type.field_by_name(name).is_none()
                {
                    Err(MemdexError::params(format!(
                        "current strict mode allows sort by existing fields only; there is no \
                         field '{name}' in namespace '{}'",
                        self.ns.name
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Unbuilt-btree sort optimization
    // -----------------------------------------------------------------------

    /// Compare the cost of the normal plan against scanning the unbuilt
    /// sort index. The normal cost is doubled before the comparison.
    fn is_sort_optimization_effective(&self, query: &Query, ctx: &SortingContext) -> bool {
        let Some(uncommitted) = ctx.uncommitted_index else {
            return false;
        };
        let entries = &query.entries;
        if entries.is_empty() {
            return true;
        }
        if entries.len() == 1
            && entries.is_leaf(0)
            && entries.leaf(0).is_some_and(|e| e.idx_no == uncommitted as i32)
        {
            return true;
        }

        let live = self.ns.live_count();
        let mut cost_normal = live;
        entries.for_each_leaf(|entry, _| {
            if entry.idx_no < 0 || entry.idx_no as usize == uncommitted || cost_normal == 0 {
                return;
            }
            let index = &self.ns.indexes[entry.idx_no as usize];
            if index.is_fulltext() {
                return;
            }
            let opts = SelectOpts {
                items_count: live,
                disable_idset_cache: true,
                ..SelectOpts::default()
            };
            if let Ok(results) = index.select_key(&entry.values, entry.condition, 0, &opts) {
                for res in results {
                    if res.comparators.is_empty() {
                        cost_normal = cost_normal.min(res.get_max_iterations(cost_normal));
                    }
                }
            }
        });

        let mut cost_optimized = live;
        let cost_normal = cost_normal.saturating_mul(2);
        if cost_normal < cost_optimized {
            cost_optimized = cost_normal + 1;
            entries.for_each_leaf(|entry, _| {
                if entry.idx_no as usize != uncommitted {
                    return;
                }
                let opts = SelectOpts {
                    items_count: live,
                    disable_idset_cache: true,
                    unbuilt_sort_orders: true,
                };
                let index = &self.ns.indexes[uncommitted];
                if let Ok(results) = index.select_key(&entry.values, entry.condition, 0, &opts) {
                    for res in results {
                        if res.comparators.is_empty() {
                            cost_optimized = cost_optimized.min(res.get_max_iterations(cost_optimized));
                        }
                    }
                }
            });
        }
        cost_optimized <= cost_normal
    }

    // -----------------------------------------------------------------------
    // Aggregators
    // -----------------------------------------------------------------------

    fn build_aggregators(&self, query: &Query) -> Result<Vec<Aggregator>> {
        let mut out = Vec::new();
        let mut distinct_positions = Vec::new();
        for agg in &query.aggregations {
            if agg.fields.is_empty() {
                return Err(MemdexError::query_exec(format!(
                    "empty set of fields for aggregation {}",
                    agg.agg_type.as_str()
                )));
            }
            if agg.agg_type != AggType::Facet {
                if agg.fields.len() != 1 {
                    return Err(MemdexError::query_exec(format!(
                        "aggregation {} accepts exactly one field",
                        agg.agg_type.as_str()
                    )));
                }
                if !agg.sorting.is_empty() {
                    return Err(MemdexError::query_exec(format!(
                        "sort is not available for aggregation {}",
                        agg.agg_type.as_str()
                    )));
                }
                if agg.limit != usize::MAX || agg.offset != 0 {
                    return Err(MemdexError::query_exec(format!(
                        "limit or offset are not available for aggregation {}",
                        agg.agg_type.as_str()
                    )));
                }
            }
            let mut fields = Vec::with_capacity(agg.fields.len());
            for name in &agg.fields {
                if agg.agg_type == AggType::Facet && agg.fields.len() > 1 {
                    if let Some(pos) = self.ns.index_by_name(name) {
                        if self.ns.indexes[pos].opts().is_array() {
                            return Err(MemdexError::query_exec(
                                "multifield facet cannot contain an array field",
                            ));
                        }
                    }
                }
                fields.push(self.field_of(name));
            }
            let mut sorting = Vec::with_capacity(agg.sorting.len());
            for entry in &agg.sorting {
                let key = if entry.expression.eq_ignore_ascii_case("count") {
                    FacetSortKey::Count
                } else {
                    let pos = agg
                        .fields
                        .iter()
                        .position(|f| f.eq_ignore_ascii_case(&entry.expression))
                        .ok_or_else(|| {
                            MemdexError::query_exec(format!(
                                "aggregation {} cannot provide sort by '{}'",
                                agg.agg_type.as_str(),
                                entry.expression
                            ))
                        })?;
                    FacetSortKey::Field(pos)
                };
                sorting.push((key, entry.desc));
            }
            if agg.agg_type == AggType::Distinct {
                distinct_positions.push(out.len());
            }
            out.push(Aggregator::new(
                agg.agg_type,
                agg.fields.iter().cloned().collect(),
                fields,
                sorting,
                agg.limit,
                agg.offset,
            ));
        }

        if !distinct_positions.is_empty() {
            let distinct_names: Vec<&str> = distinct_positions
                .iter()
                .filter_map(|&i| out[i].names().first().map(String::as_str))
                .collect();
            for agg in &out {
                if agg.agg_type() == AggType::Distinct {
                    continue;
                }
                for name in agg.names() {
                    if !distinct_names.iter().any(|d| d.eq_ignore_ascii_case(name)) {
                        return Err(MemdexError::query_exec(format!(
                            "cannot combine distinct and non-distinct aggregations on index {name}"
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Explain
    // -----------------------------------------------------------------------

    fn explain_json(
        &self,
        container: &SelectIteratorContainer,
        sorting_ctx: &SortingContext,
        max_iterations: usize,
        result: &QueryResults,
    ) -> String {
        let mut selectors = Vec::new();
        container.for_each_iterator(|it| {
            selectors.push(serde_json::json!({
                "field": it.name,
                "method": if it.is_comparator_only() { "scan" } else { "index" },
                "max_iterations": it.get_max_iterations(max_iterations),
            }));
        });
        serde_json::json!({
            "namespace": self.ns.name,
            "iterations": max_iterations,
            "sort_index": sorting_ctx
                .entries
                .first()
                .map_or("-", |e| e.expression_text.as_str()),
            "sort_by_uncommitted_index": sorting_ctx.is_optimization_enabled(),
            "matched": result.items.len(),
            "selectors": selectors,
        })
        .to_string()
    }
}
