use std::collections::HashMap;

use memdex_types::RowId;

use crate::comparator::Comparator;
use crate::idset::IdSet;

/// The outcome of one `select_key` call: either id-sets to iterate, or a
/// comparator the outer loop must run per row.
///
/// Multiple id-sets form a lazy union; the select iterator merges them
/// without materializing the combined set.
#[derive(Debug, Clone, Default)]
pub struct SelectKeyResult {
    pub idsets: Vec<IdSet>,
    pub comparators: Vec<Comparator>,
    /// Fulltext rank per row, in percent. Empty for non-ranked results.
    pub ranks: HashMap<RowId, u8>,
}

impl SelectKeyResult {
    #[must_use]
    pub fn from_idset(set: IdSet) -> Self {
        Self {
            idsets: vec![set],
            comparators: Vec::new(),
            ranks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_comparator(comparator: Comparator) -> Self {
        Self {
            idsets: Vec::new(),
            comparators: vec![comparator],
            ranks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn has_idsets(&self) -> bool {
        !self.idsets.is_empty()
    }

    #[must_use]
    pub fn is_comparator_only(&self) -> bool {
        self.idsets.is_empty() && !self.comparators.is_empty()
    }

    /// Upper bound on iteration cost, capped by `cap` (comparator-only
    /// results cost a full scan).
    #[must_use]
    pub fn get_max_iterations(&self, cap: usize) -> usize {
        if self.idsets.is_empty() {
            return cap;
        }
        let total: usize = self.idsets.iter().map(IdSet::get_max_iterations).sum();
        total.min(cap)
    }
}

/// One index condition may expand to several results (one per key for `IN`
/// sets against a tree, for example); they form a union.
pub type SelectKeyResults = Vec<SelectKeyResult>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idset::AddMode;

    #[test]
    fn test_max_iterations_sums_and_caps() {
        let mut r = SelectKeyResult::default();
        r.idsets.push(IdSet::from_ids(0..100, AddMode::Ordered));
        r.idsets.push(IdSet::from_ids(200..250, AddMode::Ordered));
        assert_eq!(r.get_max_iterations(usize::MAX), 150);
        assert_eq!(r.get_max_iterations(40), 40);
    }

    #[test]
    fn test_comparator_only_costs_full_scan() {
        use memdex_query::CondType;
        use memdex_types::CollateOpts;
        let r = SelectKeyResult::from_comparator(Comparator::new(
            crate::comparator::ComparatorField::Index(0),
            CondType::Any,
            Default::default(),
            CollateOpts::default(),
        ));
        assert!(r.is_comparator_only());
        assert_eq!(r.get_max_iterations(1234), 1234);
    }
}
