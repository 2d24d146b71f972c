use memdex_error::{MemdexError, Result};
use memdex_query::{AggType, CondType, OpType, Query, QueryEntry, SortingEntry, StrictMode};
use memdex_types::{KeyValueKind, Variant, NOT_SET, SET_BY_JSON_PATH};
use smallvec::smallvec;

use crate::nsview::NsView;

/// Rewrites a query against one namespace before iterator construction:
/// name resolution, literal conversion, composite substitution, distinct
/// markers and sort-order deduction.
pub struct QueryPreprocessor;

impl QueryPreprocessor {
    /// Resolve every entry's index name. Unresolved names stay json-path
    /// comparators when the strict mode allows, fail otherwise.
    pub fn lookup_query_indexes(query: &mut Query, ns: &NsView<'_>) -> Result<()> {
        let strict = if query.strict_mode == StrictMode::NotSet {
            ns.strict_mode
        } else {
            query.strict_mode
        };
        let mut failure = None;
        query.entries.for_each_leaf_mut(|entry, _| {
            if failure.is_some() || entry.is_join() || entry.idx_no != NOT_SET {
                return;
            }
            match ns.index_by_name(&entry.index) {
                Some(pos) => entry.idx_no = pos as i32,
                None => {
                    match strict {
                        StrictMode::Indexes => {
                            failure = Some(MemdexError::params(format!(
                                "current strict mode allows filtering by index fields only; \
                                 there is no index '{}' in namespace '{}'",
                                entry.index, ns.name
                            )));
                        }
                        StrictMode::Names => {
                            if ns.tags_matcher.path2tag(&entry.index).is_empty() {
                                failure = Some(MemdexError::params(format!(
                                    "current strict mode allows filtering by existing fields \
                                     only; there is no field '{}' in namespace '{}'",
                                    entry.index, ns.name
                                )));
                            }
                        }
                        StrictMode::None | StrictMode::NotSet => {}
                    }
                    entry.idx_no = SET_BY_JSON_PATH;
                }
            }
        });
        failure.map_or(Ok(()), Err)
    }

    /// Convert literals to the declared kind of their index.
    pub fn convert_where_values(query: &mut Query, ns: &NsView<'_>) -> Result<()> {
        let mut failure = None;
        query.entries.for_each_leaf_mut(|entry, _| {
            if failure.is_some() || entry.idx_no < 0 {
                return;
            }
            let index = &ns.indexes[entry.idx_no as usize];
            let kind = index.key_type();
            if matches!(
                kind,
                KeyValueKind::Composite | KeyValueKind::Tuple | KeyValueKind::Undefined
            ) || index.is_fulltext()
                || entry.condition == CondType::DWithin
            {
                return;
            }
            for value in &mut entry.values {
                if value.is_null() {
                    continue;
                }
                match value.convert(kind) {
                    Ok(converted) => *value = converted,
                    Err(err) => {
                        failure = Some(err);
                        return;
                    }
                }
            }
        });
        failure.map_or(Ok(()), Err)
    }

    /// Replace a contiguous `And`-conjunction of equalities that covers a
    /// composite index's exact field set with one composite equality.
    pub fn substitute_composite_indexes(query: &mut Query, ns: &NsView<'_>) -> Result<()> {
        for (composite_pos, composite) in ns
            .indexes
            .iter()
            .enumerate()
            .filter(|(_, idx)| idx.is_composite())
        {
            let wanted: Vec<i32> = composite.fields().iter().collect();
            loop {
                let Some((from, to, tuple)) = Self::find_conjunction(query, &wanted) else {
                    break;
                };
                let key = composite.make_composite_key(&tuple)?;
                query.entries.replace_span(
                    from,
                    to,
                    OpType::And,
                    QueryEntry {
                        index: composite.name().to_owned(),
                        idx_no: composite_pos as i32,
                        condition: CondType::Eq,
                        values: smallvec![key],
                        distinct: false,
                        join_index: NOT_SET,
                    },
                );
            }
        }
        Ok(())
    }

    /// Find a run of sibling And-equality leaves whose field set equals
    /// `wanted`; returns the span and the values in `wanted` order.
    fn find_conjunction(query: &Query, wanted: &[i32]) -> Option<(usize, usize, Vec<Variant>)> {
        let entries = &query.entries;
        let len = entries.len();
        let mut run: Vec<(usize, i32, Variant)> = Vec::new();
        let mut i = 0usize;
        while i <= len {
            let qualifies = i < len
                && entries.is_leaf(i)
                && entries.op(i) == OpType::And
                && entries.leaf(i).is_some_and(|e| {
                    !e.is_join()
                        && !e.distinct
                        && e.condition == CondType::Eq
                        && e.idx_no >= 0
                        && e.values.len() == 1
                });
            if qualifies {
                let entry = entries.leaf(i).expect("leaf checked");
                run.push((i, entry.idx_no, entry.values[0].clone()));
            }
            if !qualifies || i + 1 > len {
                // Check every window of the finished run.
                if run.len() >= wanted.len() {
                    for window in run.windows(wanted.len()) {
                        let mut fields: Vec<i32> = window.iter().map(|(_, f, _)| *f).collect();
                        fields.sort_unstable();
                        let mut sorted_wanted = wanted.to_vec();
                        sorted_wanted.sort_unstable();
                        if fields == sorted_wanted {
                            let from = window[0].0;
                            let to = window[window.len() - 1].0 + 1;
                            let tuple = wanted
                                .iter()
                                .map(|f| {
                                    window
                                        .iter()
                                        .find(|(_, wf, _)| wf == f)
                                        .map(|(_, _, v)| v.clone())
                                        .expect("field set matched")
                                })
                                .collect();
                            return Some((from, to, tuple));
                        }
                    }
                }
                run.clear();
            }
            if i < len {
                i = entries.next(i);
            } else {
                break;
            }
        }
        None
    }

    /// Turn `Distinct(field)` aggregations into marker entries.
    pub fn add_distinct_entries(query: &mut Query) {
        let distinct_fields: Vec<String> = query
            .aggregations
            .iter()
            .filter(|agg| agg.agg_type == AggType::Distinct)
            .filter_map(|agg| agg.fields.first().cloned())
            .collect();
        for field in distinct_fields {
            let mut entry = QueryEntry::new(CondType::Any, field, smallvec![]);
            entry.distinct = true;
            query.entries.append(OpType::And, entry);
        }
    }

    /// Whether any resolved entry targets a fulltext index.
    #[must_use]
    pub fn contains_fulltext(query: &Query, ns: &NsView<'_>) -> bool {
        let mut found = false;
        query.entries.for_each_leaf(|entry, _| {
            if entry.idx_no >= 0 && ns.indexes[entry.idx_no as usize].is_fulltext() {
                found = true;
            }
        });
        found
    }

    /// Best-effort: when the query has no explicit sort, reuse the order of
    /// a tree index already referenced by the where clause. The selector
    /// may still discard the deduced sort.
    #[must_use]
    pub fn detect_optimal_sort_order(query: &Query, ns: &NsView<'_>) -> Option<SortingEntry> {
        if !query.sorting_entries.is_empty() || !query.forced_sort_order.is_empty() {
            return None;
        }
        let mut best: Option<SortingEntry> = None;
        query.entries.for_each_leaf(|entry, _| {
            if best.is_some() || entry.idx_no < 0 {
                return;
            }
            let index = &ns.indexes[entry.idx_no as usize];
            if index.is_ordered() {
                best = Some(SortingEntry::new(index.name(), false));
            }
        });
        best
    }
}
