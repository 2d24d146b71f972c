use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hasher;

use memdex_error::{MemdexError, Result};
use memdex_query::{Query, SortExpression, SortValueResolver};
use memdex_types::{
    CollateOpts, ConstPayload, FieldsSet, ItemRef, KeyValueKind, PayloadValue, TagsMatcher,
    Variant,
};
use xxhash_rust::xxh3::Xxh3;

use crate::joins::JoinedSelector;
use crate::nsview::NsView;

// ---------------------------------------------------------------------------
// Sorting context
// ---------------------------------------------------------------------------

/// How one resolved sort entry obtains its value.
#[derive(Debug)]
pub enum SortKind {
    /// Fixed payload slot of an index.
    Index { field: usize, collate: CollateOpts },
    /// Non-indexed json path.
    JsonPath { path: String },
    /// Arithmetic sort expression.
    Expression { expr: SortExpression },
    /// Fulltext rank.
    Rank,
}

/// One resolved `ORDER BY` entry.
#[derive(Debug)]
pub struct ResolvedSortEntry {
    pub expression_text: String,
    pub desc: bool,
    pub kind: SortKind,
}

/// Everything the selector resolved about the query's ordering.
#[derive(Debug, Default)]
pub struct SortingContext {
    pub entries: Vec<ResolvedSortEntry>,
    pub forced_mode: bool,
    /// The first entry rides the leading iterator's index order; no
    /// post-loop sort is needed for it.
    pub index_ordered_first: bool,
    /// Tree index chosen for the unbuilt-btree scan optimization.
    pub uncommitted_index: Option<usize>,
}

impl SortingContext {
    #[must_use]
    pub fn is_optimization_enabled(&self) -> bool {
        self.uncommitted_index.is_some()
    }

    pub fn reset_optimization(&mut self) {
        self.uncommitted_index = None;
    }

    #[must_use]
    pub fn multi_column(&self) -> bool {
        self.entries.len() > 1
    }

    /// Whether matched rows still need sorting after the merge loop.
    #[must_use]
    pub fn post_loop_sorting_required(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.forced_mode || self.multi_column() || !self.index_ordered_first
    }
}

// ---------------------------------------------------------------------------
// Item comparator
// ---------------------------------------------------------------------------

/// Lexicographic comparison of result rows over the resolved sort entries.
pub struct ItemComparator<'a> {
    pub ns: &'a NsView<'a>,
    pub ctx: &'a SortingContext,
    pub joined: &'a [JoinedSelector<'a>],
    pub joined_left_fields: &'a [Vec<Option<usize>>],
}

impl ItemComparator<'_> {
    fn payload_of<'b>(&'b self, item: &'b ItemRef) -> &'b PayloadValue {
        item.value
            .as_ref()
            .unwrap_or(&self.ns.items[item.row_id as usize])
    }

    /// Compare under all entries, or all but the first when the forced-sort
    /// partition already handled it.
    pub fn compare(&self, a: &ItemRef, b: &ItemRef, skip_first: bool) -> Ordering {
        let from = usize::from(skip_first);
        for entry in &self.ctx.entries[from.min(self.ctx.entries.len())..] {
            let ord = self.compare_entry(entry, a, b);
            if ord != Ordering::Equal {
                return if entry.desc { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    }

    fn compare_entry(&self, entry: &ResolvedSortEntry, a: &ItemRef, b: &ItemRef) -> Ordering {
        let pa = ConstPayload::new(self.ns.payload_type, self.payload_of(a));
        let pb = ConstPayload::new(self.ns.payload_type, self.payload_of(b));
        match &entry.kind {
            SortKind::Index { field, collate } => {
                let va = pa.get(*field);
                let vb = pb.get(*field);
                cmp_first(&va, &vb, collate)
            }
            SortKind::JsonPath { path } => {
                let va = pa
                    .get_by_json_path(path, self.ns.tags_matcher, KeyValueKind::Undefined)
                    .unwrap_or_default();
                let vb = pb
                    .get_by_json_path(path, self.ns.tags_matcher, KeyValueKind::Undefined)
                    .unwrap_or_default();
                cmp_first(&va, &vb, &CollateOpts::default())
            }
            SortKind::Expression { expr } => {
                let va = self.eval_expr(expr, a, &pa);
                let vb = self.eval_expr(expr, b, &pb);
                va.partial_cmp(&vb).unwrap_or(Ordering::Equal)
            }
            SortKind::Rank => a.rank.cmp(&b.rank),
        }
    }

    fn eval_expr(&self, expr: &SortExpression, item: &ItemRef, pl: &ConstPayload<'_>) -> f64 {
        let resolver = ExprResolver {
            pl,
            tm: self.ns.tags_matcher,
            joined: self.joined,
            joined_left_fields: self.joined_left_fields,
            rank: f64::from(item.rank),
        };
        expr.calculate(&resolver).unwrap_or(0.0)
    }
}

fn cmp_first(
    a: &memdex_types::VariantArray,
    b: &memdex_types::VariantArray,
    collate: &CollateOpts,
) -> Ordering {
    match (a.first(), b.first()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(l), Some(r)) => l.relax_cmp(r, collate),
    }
}

/// Resolves sort-expression leaves against one row.
struct ExprResolver<'a, 'b> {
    pl: &'a ConstPayload<'b>,
    tm: &'a TagsMatcher,
    joined: &'a [JoinedSelector<'a>],
    joined_left_fields: &'a [Vec<Option<usize>>],
    rank: f64,
}

impl SortValueResolver for ExprResolver<'_, '_> {
    fn index_value(&self, column: &str) -> Result<f64> {
        let values = match self.pl.payload_type().field_by_name(column) {
            Some(field) => self.pl.get(field),
            None => self
                .pl
                .get_by_json_path(column, self.tm, KeyValueKind::Undefined)?,
        };
        Ok(values.first().and_then(Variant::as_double).unwrap_or(0.0))
    }

    fn joined_value(&self, ns_idx: usize, column: &str) -> Result<f64> {
        let selector = self.joined.get(ns_idx).ok_or_else(|| {
            MemdexError::query_exec(format!("no joined namespace #{ns_idx} in sort expression"))
        })?;
        let rows = selector.matching_rows(
            self.pl,
            self.tm,
            self.joined_left_fields.get(ns_idx).map_or(&[], Vec::as_slice),
        )?;
        let Some(row) = rows.first() else {
            return Ok(0.0);
        };
        let value = row
            .value
            .as_ref()
            .ok_or_else(|| MemdexError::logic("joined row without payload"))?;
        let right = ConstPayload::new(&selector.right_payload_type, value);
        let values = match selector.right_payload_type.field_by_name(column) {
            Some(field) => right.get(field),
            None => right.get_by_json_path(
                column,
                &selector.right_tags_matcher,
                KeyValueKind::Undefined,
            )?,
        };
        Ok(values.first().and_then(Variant::as_double).unwrap_or(0.0))
    }

    fn rank(&self) -> f64 {
        self.rank
    }
}

// ---------------------------------------------------------------------------
// Forced sort
// ---------------------------------------------------------------------------

/// Partition and order results by the explicit value list of the first sort
/// entry. Returns the range still subject to the general comparator.
pub fn apply_forced_sort(
    items: &mut Vec<ItemRef>,
    query: &Query,
    ns: &NsView<'_>,
    comparator: &ItemComparator<'_>,
) -> Result<std::ops::Range<usize>> {
    let first = query
        .sorting_entries
        .first()
        .ok_or_else(|| MemdexError::logic("forced sort without a sort entry"))?;
    if matches!(
        comparator.ctx.entries.first().map(|e| &e.kind),
        Some(SortKind::Expression { .. })
    ) {
        return Err(MemdexError::logic(
            "force sort could not be performed by expression",
        ));
    }
    if query.merge_queries.len() > 1 {
        return Err(MemdexError::logic(
            "force sort could not be applied to 'merged' queries",
        ));
    }
    let desc = first.desc;
    let multi_column = comparator.ctx.multi_column();
    let idx_pos = ns.index_by_name(&first.expression).ok_or_else(|| {
        MemdexError::params(format!("there is no index '{}'", first.expression))
    })?;
    let index = &ns.indexes[idx_pos];
    if index.opts().is_array() {
        return Err(MemdexError::query_exec(
            "this type of sorting cannot be applied to a field of array type",
        ));
    }

    // Position of each item's key in the forced list.
    let positions: Vec<Option<usize>> = if index.is_composite() {
        forced_positions_composite(items, query, ns, index)?
    } else {
        forced_positions_regular(items, query, ns, index)?
    };

    // Stable partition: the forced set leads for asc and trails for desc.
    let mut in_set: Vec<(ItemRef, usize)> = Vec::new();
    let mut rest: Vec<ItemRef> = Vec::new();
    for (item, pos) in items.drain(..).zip(positions) {
        match pos {
            Some(p) => in_set.push((item, p)),
            None => rest.push(item),
        }
    }
    in_set.sort_by(|(a, ap), (b, bp)| {
        if ap == bp {
            // Ties break by the remaining sort entries (which carry their
            // own directions), or by row id following the first entry's
            // direction.
            if multi_column {
                comparator.compare(a, b, true)
            } else if desc {
                b.row_id.cmp(&a.row_id)
            } else {
                a.row_id.cmp(&b.row_id)
            }
        } else if desc {
            bp.cmp(ap)
        } else {
            ap.cmp(bp)
        }
    });

    let general_range;
    if desc {
        general_range = 0..rest.len();
        items.extend(rest);
        items.extend(in_set.into_iter().map(|(item, _)| item));
    } else {
        let boundary = in_set.len();
        items.extend(in_set.into_iter().map(|(item, _)| item));
        general_range = boundary..boundary + rest.len();
        items.extend(rest);
    }
    Ok(general_range)
}

fn forced_positions_regular(
    items: &[ItemRef],
    query: &Query,
    ns: &NsView<'_>,
    index: &memdex_index::Index,
) -> Result<Vec<Option<usize>>> {
    let field = index
        .fields()
        .iter()
        .find(|&f| f >= 0)
        .map(|f| f as usize)
        .ok_or_else(|| MemdexError::logic("forced sort index has no payload field"))?;
    let mut sort_map: HashMap<Variant, usize> = HashMap::new();
    for (cost, value) in query.forced_sort_order.iter().enumerate() {
        let key = value.convert(index.key_type())?;
        sort_map.entry(key).or_insert(cost);
    }
    Ok(items
        .iter()
        .map(|item| {
            let pv = item
                .value
                .as_ref()
                .unwrap_or(&ns.items[item.row_id as usize]);
            let values = ConstPayload::new(ns.payload_type, pv).get(field);
            values.first().and_then(|v| sort_map.get(v).copied())
        })
        .collect())
}

fn forced_positions_composite(
    items: &[ItemRef],
    query: &Query,
    ns: &NsView<'_>,
    index: &memdex_index::Index,
) -> Result<Vec<Option<usize>>> {
    // The composite forced-sort map compares under default collation.
    let collate = CollateOpts::default();
    let fields = index.fields().clone();
    let hash_of = |pv: &PayloadValue, fields: &FieldsSet| {
        let mut hasher = Xxh3::new();
        ConstPayload::new(ns.payload_type, pv).hash_fields(fields, &mut hasher);
        hasher.finish()
    };
    let mut sort_map: HashMap<u64, Vec<(PayloadValue, usize)>> = HashMap::new();
    for (cost, value) in query.forced_sort_order.iter().enumerate() {
        let key = match value {
            Variant::Composite(pv) => pv.clone(),
            Variant::Tuple(tuple) => match index.make_composite_key(tuple)? {
                Variant::Composite(pv) => pv,
                _ => unreachable!("make_composite_key returns composite"),
            },
            other => {
                return Err(MemdexError::params(format!(
                    "forced sort over a composite index expects tuples, got {}",
                    other.kind().as_str()
                )))
            }
        };
        sort_map
            .entry(hash_of(&key, &fields))
            .or_default()
            .push((key, cost));
    }
    Ok(items
        .iter()
        .map(|item| {
            let pv = item
                .value
                .as_ref()
                .unwrap_or(&ns.items[item.row_id as usize]);
            let bucket = sort_map.get(&hash_of(pv, &fields))?;
            let pl = ConstPayload::new(ns.payload_type, pv);
            bucket
                .iter()
                .find(|(key, _)| {
                    pl.compare(
                        &ConstPayload::new(ns.payload_type, key),
                        &fields,
                        &collate,
                    ) == Ordering::Equal
                })
                .map(|(_, cost)| *cost)
        })
        .collect())
}

/// Stable sort of the given range under the comparator.
pub fn apply_general_sort(
    items: &mut [ItemRef],
    range: std::ops::Range<usize>,
    comparator: &ItemComparator<'_>,
    skip_first: bool,
) {
    items[range].sort_by(|a, b| comparator.compare(a, b, skip_first));
}

/// Apply offset and limit to the final item list.
pub fn set_limit_and_offset(items: &mut Vec<ItemRef>, offset: usize, limit: usize) {
    if offset > 0 {
        items.drain(..offset.min(items.len()));
    }
    items.truncate(limit);
}
