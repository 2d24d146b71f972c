use std::collections::{HashMap, HashSet};

use memdex_index::{Comparator, ComparatorField, IdSet, SelectKeyResult};
use memdex_types::{RowId, Variant};

/// Cursor ordering policy for [`SelectIterator::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterOrder {
    /// Merge-sort the union ascending.
    #[default]
    Auto,
    /// Keep the stored order; reversible (index sort-order scans).
    Preserve,
    /// Keep the stored order and ignore reverse (fulltext relevancy).
    ForcedFirst,
}

/// One iterable condition of the select loop.
///
/// Wraps a `SelectKeyResult`: id-sets form a lazy union the cursor walks in
/// ascending row-id order (or the stored order for relevancy-ranked
/// fulltext results); comparator-only results are driven by the outer loop
/// through [`Self::contains`]-style matching instead.
#[derive(Debug)]
pub struct SelectIterator {
    pub name: String,
    pub idsets: Vec<IdSet>,
    pub comparators: Vec<Comparator>,
    pub ranks: HashMap<RowId, u8>,
    /// Marker entry from a `Distinct` aggregation.
    pub distinct: bool,
    /// Where a distinct entry reads its value from.
    pub distinct_field: Option<ComparatorField>,
    /// Values already emitted for a distinct entry; rows carrying one of
    /// these no longer match.
    pub distinct_seen: HashSet<Variant>,
    /// How [`Self::start`] treats the stored id order.
    pub order: IterOrder,
    /// Inner-join placeholder position, when this iterator stands for one.
    pub join_index: Option<usize>,
    cursor: Cursor,
}

#[derive(Debug)]
enum Cursor {
    Unstarted,
    Range {
        from: RowId,
        to: RowId,
        cur: i64,
        reverse: bool,
    },
    Materialized {
        ids: Vec<RowId>,
        pos: i64,
        reverse: bool,
    },
}

impl SelectIterator {
    #[must_use]
    pub fn new(result: SelectKeyResult, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idsets: result.idsets,
            comparators: result.comparators,
            ranks: result.ranks,
            distinct: false,
            distinct_field: None,
            distinct_seen: HashSet::new(),
            order: IterOrder::Auto,
            join_index: None,
            cursor: Cursor::Unstarted,
        }
    }

    /// A synthetic scan over `[0, limit)`.
    #[must_use]
    pub fn scan(limit: RowId) -> Self {
        Self::new(
            SelectKeyResult::from_idset(IdSet::range(0, limit)),
            "-scan",
        )
    }

    /// A scan over an explicit row order (sort-order driven scans). The
    /// order is preserved and reversible.
    #[must_use]
    pub fn scan_ordered(ids: Vec<RowId>, name: impl Into<String>) -> Self {
        let mut it = Self::new(
            SelectKeyResult::from_idset(IdSet::from_ids(ids, memdex_index::AddMode::Unordered)),
            name,
        );
        it.order = IterOrder::Preserve;
        it
    }

    #[must_use]
    pub fn has_idsets(&self) -> bool {
        !self.idsets.is_empty()
    }

    #[must_use]
    pub fn is_comparator_only(&self) -> bool {
        self.idsets.is_empty() && !self.comparators.is_empty()
    }

    /// Upper bound on scan cost; comparator-only iterators cost the cap.
    #[must_use]
    pub fn get_max_iterations(&self, cap: usize) -> usize {
        if self.idsets.is_empty() {
            return cap;
        }
        self.idsets
            .iter()
            .map(IdSet::get_max_iterations)
            .sum::<usize>()
            .min(cap)
    }

    /// Membership test against the id-set union.
    #[must_use]
    pub fn contains(&self, id: RowId) -> bool {
        self.idsets.iter().any(|set| set.contains(id))
    }

    #[must_use]
    pub fn rank(&self, id: RowId) -> u8 {
        self.ranks.get(&id).copied().unwrap_or(0)
    }

    /// Position the cursor before the first candidate.
    pub fn start(&mut self, reverse: bool) {
        let reverse = reverse && self.order != IterOrder::ForcedFirst;
        self.cursor = match self.idsets.as_slice() {
            [IdSet::Range(from, to)] => Cursor::Range {
                from: *from,
                to: *to,
                cur: if reverse {
                    i64::from(*to)
                } else {
                    i64::from(*from) - 1
                },
                reverse,
            },
            sets => {
                let mut ids: Vec<RowId> = sets.iter().flat_map(IdSet::iter).collect();
                if self.order == IterOrder::Auto {
                    ids.sort_unstable();
                    ids.dedup();
                }
                let pos = if reverse { ids.len() as i64 } else { -1 };
                Cursor::Materialized { ids, pos, reverse }
            }
        };
    }

    /// Advance to the next candidate; false on exhaustion.
    pub fn next(&mut self) -> bool {
        match &mut self.cursor {
            Cursor::Unstarted => false,
            Cursor::Range {
                from,
                to,
                cur,
                reverse,
            } => {
                if *reverse {
                    *cur -= 1;
                    *cur >= i64::from(*from)
                } else {
                    *cur += 1;
                    *cur < i64::from(*to)
                }
            }
            Cursor::Materialized { ids, pos, reverse } => {
                if *reverse {
                    *pos -= 1;
                    *pos >= 0
                } else {
                    *pos += 1;
                    (*pos as usize) < ids.len()
                }
            }
        }
    }

    /// The current candidate row id. Only valid after a successful
    /// [`Self::next`].
    #[must_use]
    pub fn val(&self) -> RowId {
        match &self.cursor {
            Cursor::Unstarted => 0,
            Cursor::Range { cur, .. } => *cur as RowId,
            Cursor::Materialized { ids, pos, .. } => ids[*pos as usize],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdex_index::AddMode;

    fn drain(it: &mut SelectIterator) -> Vec<RowId> {
        let mut out = Vec::new();
        while it.next() {
            out.push(it.val());
        }
        out
    }

    #[test]
    fn test_scan_range_forward_and_reverse() {
        let mut it = SelectIterator::scan(4);
        it.start(false);
        assert_eq!(drain(&mut it), vec![0, 1, 2, 3]);
        it.start(true);
        assert_eq!(drain(&mut it), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_union_of_idsets_is_merged_sorted() {
        let mut result = SelectKeyResult::default();
        result.idsets.push(IdSet::from_ids([5, 1], AddMode::Ordered));
        result.idsets.push(IdSet::from_ids([3, 1], AddMode::Ordered));
        let mut it = SelectIterator::new(result, "idx");
        it.start(false);
        assert_eq!(drain(&mut it), vec![1, 3, 5]);
        assert!(it.contains(3));
        assert!(!it.contains(4));
    }

    #[test]
    fn test_preserve_order_is_reversible() {
        let mut it = SelectIterator::scan_ordered(vec![7, 2, 9], "-scan");
        it.start(false);
        assert_eq!(drain(&mut it), vec![7, 2, 9]);
        it.start(true);
        assert_eq!(drain(&mut it), vec![9, 2, 7]);
    }

    #[test]
    fn test_forced_first_ignores_reverse() {
        let mut it = SelectIterator::scan_ordered(vec![7, 2, 9], "ft");
        it.order = IterOrder::ForcedFirst;
        it.start(true);
        assert_eq!(drain(&mut it), vec![7, 2, 9]);
    }

    #[test]
    fn test_max_iterations() {
        let it = SelectIterator::scan(100);
        assert_eq!(it.get_max_iterations(usize::MAX), 100);
        let mut result = SelectKeyResult::default();
        result.comparators.push(memdex_index::Comparator::new(
            memdex_index::ComparatorField::Index(0),
            memdex_query::CondType::Any,
            Default::default(),
            Default::default(),
        ));
        let it = SelectIterator::new(result, "cmp");
        assert_eq!(it.get_max_iterations(42), 42);
    }
}
