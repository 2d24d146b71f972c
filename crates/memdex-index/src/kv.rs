use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use memdex_error::{MemdexError, Result};
use memdex_query::CondType;
use memdex_types::{CollateOpts, KeyValueKind, RowId, Variant, VariantArray};

use crate::comparator::{Comparator, ComparatorField};
use crate::idset::{AddMode, IdSet};
use crate::selectkey::{SelectKeyResult, SelectKeyResults};
use crate::SelectOpts;

// ---------------------------------------------------------------------------
// Hash index (unordered)
// ---------------------------------------------------------------------------

/// `key -> IdSet` with O(1) point lookups. Keys are stored normalized so
/// collated equality maps to plain map equality.
#[derive(Debug, Default, Clone)]
pub struct HashIndex {
    map: HashMap<Variant, IdSet>,
    kind: KeyValueKind,
    collate: CollateOpts,
    field: usize,
}

impl HashIndex {
    #[must_use]
    pub fn new(kind: KeyValueKind, collate: CollateOpts, field: usize) -> Self {
        Self {
            map: HashMap::new(),
            kind,
            collate,
            field,
        }
    }

    pub fn upsert(&mut self, values: &VariantArray, id: RowId) -> Result<()> {
        for value in values {
            let key = value.convert(self.kind)?.normalized(&self.collate);
            self.map.entry(key).or_default().add(id, AddMode::Ordered);
        }
        Ok(())
    }

    pub fn delete(&mut self, values: &VariantArray, id: RowId) -> Result<()> {
        for value in values {
            let key = value.convert(self.kind)?.normalized(&self.collate);
            if let Some(set) = self.map.get_mut(&key) {
                set.remove(id);
                if set.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Number of distinct keys; the preprocessor's only cardinality input.
    #[must_use]
    pub fn keys_count(&self) -> usize {
        self.map.len()
    }

    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        match condition {
            CondType::Eq | CondType::Set => {
                let mut res = SelectKeyResult::default();
                for value in values {
                    let key = value.convert(self.kind)?.normalized(&self.collate);
                    if let Some(set) = self.map.get(&key) {
                        res.idsets.push(set.clone());
                    }
                }
                // A miss still yields one empty id-set so the iterator
                // matches nothing instead of everything.
                if res.idsets.is_empty() {
                    res.idsets.push(IdSet::new());
                }
                Ok(vec![res])
            }
            // Every live row carries a value for a non-sparse field; freed
            // slots are skipped by the select loop.
            CondType::Any => Ok(vec![SelectKeyResult::from_idset(IdSet::range(
                0,
                opts.items_count as RowId,
            ))]),
            _ => Ok(vec![SelectKeyResult::from_comparator(self.comparator(
                condition,
                values.clone(),
            ))]),
        }
    }

    fn comparator(&self, condition: CondType, values: VariantArray) -> Comparator {
        Comparator::new(
            ComparatorField::Index(self.field),
            condition,
            values,
            self.collate.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tree index (ordered)
// ---------------------------------------------------------------------------

/// Map key carrying its collation so the `BTreeMap` orders through it.
#[derive(Debug, Clone)]
struct TreeKey {
    value: Variant,
    collate: Arc<CollateOpts>,
}

impl PartialEq for TreeKey {
    fn eq(&self, other: &Self) -> bool {
        self.value.collate_cmp(&other.value, &self.collate) == Ordering::Equal
    }
}

impl Eq for TreeKey {}

impl PartialOrd for TreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.collate_cmp(&other.value, &self.collate)
    }
}

/// Ordered `key -> IdSet` supporting ranges and materialized sort orders.
#[derive(Debug, Default, Clone)]
pub struct TreeIndex {
    map: BTreeMap<TreeKey, IdSet>,
    kind: KeyValueKind,
    collate: Arc<CollateOpts>,
    field: usize,
    /// Scan position -> row id, built by [`Self::commit`].
    sort_orders: Vec<RowId>,
    sort_orders_built: bool,
}

impl TreeIndex {
    #[must_use]
    pub fn new(kind: KeyValueKind, collate: CollateOpts, field: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            kind,
            collate: Arc::new(collate),
            field,
            sort_orders: Vec::new(),
            sort_orders_built: false,
        }
    }

    fn key(&self, value: &Variant) -> Result<TreeKey> {
        Ok(TreeKey {
            value: value.convert(self.kind)?,
            collate: Arc::clone(&self.collate),
        })
    }

    pub fn upsert(&mut self, values: &VariantArray, id: RowId) -> Result<()> {
        for value in values {
            let key = self.key(value)?;
            self.map.entry(key).or_default().add(id, AddMode::Ordered);
        }
        self.sort_orders_built = false;
        Ok(())
    }

    pub fn delete(&mut self, values: &VariantArray, id: RowId) -> Result<()> {
        for value in values {
            let key = self.key(value)?;
            if let Some(set) = self.map.get_mut(&key) {
                set.remove(id);
                if set.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
        self.sort_orders_built = false;
        Ok(())
    }

    #[must_use]
    pub fn keys_count(&self) -> usize {
        self.map.len()
    }

    /// Materialize the scan-position -> row-id permutation. Rows with
    /// several values (array fields) keep only their first position.
    pub fn commit(&mut self) {
        if self.sort_orders_built {
            return;
        }
        let mut orders = Vec::new();
        let mut seen = IdSet::new();
        for set in self.map.values() {
            for id in set.iter() {
                if !seen.contains(id) {
                    seen.add(id, AddMode::Ordered);
                    orders.push(id);
                }
            }
        }
        self.sort_orders = orders;
        self.sort_orders_built = true;
    }

    #[must_use]
    pub fn sort_orders(&self) -> &[RowId] {
        &self.sort_orders
    }

    #[must_use]
    pub fn sort_orders_built(&self) -> bool {
        self.sort_orders_built
    }

    /// Row ids in key order, computed on the fly. The unbuilt-btree sort
    /// optimization scans this instead of waiting for [`Self::commit`].
    #[must_use]
    pub fn ordered_ids(&self) -> Vec<RowId> {
        let mut orders = Vec::new();
        let mut seen = IdSet::new();
        for set in self.map.values() {
            for id in set.iter() {
                if !seen.contains(id) {
                    seen.add(id, AddMode::Ordered);
                    orders.push(id);
                }
            }
        }
        orders
    }

    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        match condition {
            CondType::Eq | CondType::Set => {
                let mut res = SelectKeyResult::default();
                for value in values {
                    if let Some(set) = self.map.get(&self.key(value)?) {
                        res.idsets.push(set.clone());
                    }
                }
                if res.idsets.is_empty() {
                    res.idsets.push(IdSet::new());
                }
                Ok(vec![res])
            }
            CondType::Lt | CondType::Le | CondType::Gt | CondType::Ge | CondType::Range => {
                let (lower, upper) = self.bounds(values, condition)?;
                let mut res = SelectKeyResult::default();
                for (_, set) in self.map.range((lower, upper)) {
                    res.idsets.push(set.clone());
                }
                if res.idsets.is_empty() {
                    res.idsets.push(IdSet::new());
                }
                Ok(vec![res])
            }
            CondType::Any => Ok(vec![SelectKeyResult::from_idset(IdSet::range(
                0,
                opts.items_count as RowId,
            ))]),
            _ => Ok(vec![SelectKeyResult::from_comparator(Comparator::new(
                ComparatorField::Index(self.field),
                condition,
                values.clone(),
                (*self.collate).clone(),
            ))]),
        }
    }

    fn bounds(
        &self,
        values: &VariantArray,
        condition: CondType,
    ) -> Result<(Bound<TreeKey>, Bound<TreeKey>)> {
        let first = values
            .first()
            .ok_or_else(|| MemdexError::query_exec("comparison condition requires a value"))?;
        Ok(match condition {
            CondType::Lt => (Bound::Unbounded, Bound::Excluded(self.key(first)?)),
            CondType::Le => (Bound::Unbounded, Bound::Included(self.key(first)?)),
            CondType::Gt => (Bound::Excluded(self.key(first)?), Bound::Unbounded),
            CondType::Ge => (Bound::Included(self.key(first)?), Bound::Unbounded),
            CondType::Range => {
                let second = values.get(1).ok_or_else(|| {
                    MemdexError::query_exec("RANGE condition requires exactly 2 values")
                })?;
                (
                    Bound::Included(self.key(first)?),
                    Bound::Included(self.key(second)?),
                )
            }
            _ => unreachable!("bounds is only called for ordered conditions"),
        })
    }
}

// ---------------------------------------------------------------------------
// Store index ("-")
// ---------------------------------------------------------------------------

/// No index structure at all: every condition becomes a comparator over the
/// payload, forcing a scan under the enclosing iterator.
#[derive(Debug, Default, Clone)]
pub struct StoreIndex {
    collate: CollateOpts,
    field: usize,
}

impl StoreIndex {
    #[must_use]
    pub fn new(collate: CollateOpts, field: usize) -> Self {
        Self { collate, field }
    }

    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        _opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        Ok(vec![SelectKeyResult::from_comparator(Comparator::new(
            ComparatorField::Index(self.field),
            condition,
            values.clone(),
            self.collate.clone(),
        ))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdex_types::CollateMode;
    use smallvec::smallvec;

    fn opts() -> SelectOpts {
        SelectOpts {
            items_count: 100,
            ..SelectOpts::default()
        }
    }

    fn ids(results: &SelectKeyResults) -> Vec<RowId> {
        let mut out: Vec<RowId> = results
            .iter()
            .flat_map(|r| r.idsets.iter().flat_map(IdSet::iter))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    #[test]
    fn test_hash_eq_lookup() {
        let mut idx = HashIndex::new(KeyValueKind::Int, CollateOpts::default(), 0);
        idx.upsert(&smallvec![Variant::Int(5)], 1).unwrap();
        idx.upsert(&smallvec![Variant::Int(5)], 2).unwrap();
        idx.upsert(&smallvec![Variant::Int(7)], 3).unwrap();
        let res = idx
            .select_key(&smallvec![Variant::Int(5)], CondType::Eq, &opts())
            .unwrap();
        assert_eq!(ids(&res), vec![1, 2]);
    }

    #[test]
    fn test_hash_collated_keys_collide() {
        let collate = CollateOpts::new(CollateMode::Ascii);
        let mut idx = HashIndex::new(KeyValueKind::String, collate, 0);
        idx.upsert(&smallvec![Variant::string("Apple")], 1).unwrap();
        let res = idx
            .select_key(&smallvec![Variant::string("APPLE")], CondType::Eq, &opts())
            .unwrap();
        assert_eq!(ids(&res), vec![1]);
    }

    #[test]
    fn test_hash_miss_yields_empty_idset() {
        let mut idx = HashIndex::new(KeyValueKind::Int, CollateOpts::default(), 0);
        idx.upsert(&smallvec![Variant::Int(5)], 1).unwrap();
        let res = idx
            .select_key(&smallvec![Variant::Int(6)], CondType::Eq, &opts())
            .unwrap();
        assert!(res[0].has_idsets());
        assert_eq!(res[0].get_max_iterations(100), 0);
    }

    #[test]
    fn test_hash_delete_drops_empty_keys() {
        let mut idx = HashIndex::new(KeyValueKind::Int, CollateOpts::default(), 0);
        idx.upsert(&smallvec![Variant::Int(5)], 1).unwrap();
        idx.delete(&smallvec![Variant::Int(5)], 1).unwrap();
        assert_eq!(idx.keys_count(), 0);
    }

    #[test]
    fn test_hash_unanswerable_condition_falls_back_to_comparator() {
        let idx = HashIndex::new(KeyValueKind::Int, CollateOpts::default(), 0);
        let res = idx
            .select_key(&smallvec![Variant::Int(5)], CondType::Lt, &opts())
            .unwrap();
        assert!(res[0].is_comparator_only());
    }

    #[test]
    fn test_tree_range_scan() {
        let mut idx = TreeIndex::new(KeyValueKind::Int, CollateOpts::default(), 0);
        for (id, v) in [(1u32, 10), (2, 20), (3, 30), (4, 40)] {
            idx.upsert(&smallvec![Variant::Int(v)], id).unwrap();
        }
        let res = idx
            .select_key(
                &smallvec![Variant::Int(15), Variant::Int(35)],
                CondType::Range,
                &opts(),
            )
            .unwrap();
        assert_eq!(ids(&res), vec![2, 3]);
        let res = idx
            .select_key(&smallvec![Variant::Int(20)], CondType::Gt, &opts())
            .unwrap();
        assert_eq!(ids(&res), vec![3, 4]);
        let res = idx
            .select_key(&smallvec![Variant::Int(20)], CondType::Le, &opts())
            .unwrap();
        assert_eq!(ids(&res), vec![1, 2]);
    }

    #[test]
    fn test_tree_sort_orders_follow_key_order() {
        let mut idx = TreeIndex::new(KeyValueKind::Int, CollateOpts::default(), 0);
        idx.upsert(&smallvec![Variant::Int(30)], 0).unwrap();
        idx.upsert(&smallvec![Variant::Int(10)], 1).unwrap();
        idx.upsert(&smallvec![Variant::Int(20)], 2).unwrap();
        assert!(!idx.sort_orders_built());
        idx.commit();
        assert!(idx.sort_orders_built());
        assert_eq!(idx.sort_orders(), &[1, 2, 0]);
        // Mutation invalidates the built orders.
        idx.upsert(&smallvec![Variant::Int(5)], 3).unwrap();
        assert!(!idx.sort_orders_built());
        assert_eq!(idx.ordered_ids(), vec![3, 1, 2, 0]);
    }

    #[test]
    fn test_store_always_produces_comparator() {
        let idx = StoreIndex::new(CollateOpts::default(), 2);
        let res = idx
            .select_key(&smallvec![Variant::Int(5)], CondType::Eq, &opts())
            .unwrap();
        assert!(res[0].is_comparator_only());
    }
}
