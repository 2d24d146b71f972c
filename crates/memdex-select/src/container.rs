use memdex_error::Result;
use memdex_query::OpType;
use memdex_types::{ConstPayload, RowId, TagsMatcher};

use crate::iterator::SelectIterator;

/// Callback deciding whether an inner-join placeholder matches a row.
pub type JoinMatcher<'a> =
    dyn FnMut(usize, RowId, &ConstPayload<'_>) -> Result<bool> + 'a;

#[derive(Debug)]
enum CNode {
    Leaf { op: OpType, it: SelectIterator },
    Group { op: OpType, size: usize },
}

impl CNode {
    const fn op(&self) -> OpType {
        match self {
            Self::Leaf { op, .. } | Self::Group { op, .. } => *op,
        }
    }

    const fn size(&self) -> usize {
        match self {
            Self::Leaf { .. } => 1,
            Self::Group { size, .. } => *size,
        }
    }
}

/// A flat tree of select iterators mirroring the query's boolean structure.
///
/// The first root node drives the merge loop; every other node answers
/// membership (id-sets) or predicate (comparators) questions per candidate
/// row.
#[derive(Debug, Default)]
pub struct SelectIteratorContainer {
    nodes: Vec<CNode>,
    active_brackets: Vec<usize>,
}

impl SelectIteratorContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn append(&mut self, op: OpType, it: SelectIterator) {
        self.grow_active(1);
        self.nodes.push(CNode::Leaf { op, it });
    }

    /// Prepend an iterator at the root. Used for the synthetic `-scan`.
    pub fn append_front(&mut self, op: OpType, it: SelectIterator) {
        self.nodes.insert(0, CNode::Leaf { op, it });
        for idx in &mut self.active_brackets {
            *idx += 1;
        }
    }

    pub fn open_bracket(&mut self, op: OpType) {
        self.grow_active(1);
        self.active_brackets.push(self.nodes.len());
        self.nodes.push(CNode::Group { op, size: 1 });
    }

    pub fn close_bracket(&mut self) {
        self.active_brackets.pop();
    }

    fn grow_active(&mut self, by: usize) {
        for &idx in &self.active_brackets {
            if let CNode::Group { size, .. } = &mut self.nodes[idx] {
                *size += by;
            }
        }
    }

    pub fn for_each_iterator(&self, mut f: impl FnMut(&SelectIterator)) {
        for node in &self.nodes {
            if let CNode::Leaf { it, .. } = node {
                f(it);
            }
        }
    }

    pub fn for_each_iterator_mut(&mut self, mut f: impl FnMut(&mut SelectIterator)) {
        for node in &mut self.nodes {
            if let CNode::Leaf { it, .. } = node {
                f(it);
            }
        }
    }

    #[must_use]
    pub fn has_idsets(&self) -> bool {
        let mut found = false;
        self.for_each_iterator(|it| found |= it.has_idsets());
        found
    }

    /// The iterator driving the merge loop. Valid only after
    /// [`Self::check_first_query`].
    pub fn leading_iterator_mut(&mut self) -> Option<&mut SelectIterator> {
        match self.nodes.first_mut() {
            Some(CNode::Leaf { it, .. }) => Some(it),
            _ => None,
        }
    }

    #[must_use]
    pub fn leading_iterator(&self) -> Option<&SelectIterator> {
        match self.nodes.first() {
            Some(CNode::Leaf { it, .. }) => Some(it),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Cost ordering
    // -----------------------------------------------------------------------

    /// Reorder peers inside every `And`-group by ascending cost, comparators
    /// last. An `Or`-chain travels with the entry it extends.
    pub fn sort_by_cost(&mut self, max_iterations: usize) {
        self.sort_group(0, self.nodes.len(), max_iterations);
    }

    fn sort_group(&mut self, from: usize, to: usize, max_iterations: usize) {
        // Recurse into subtrees first (indexes stay valid while their span
        // contents are reordered).
        let mut i = from;
        while i < to {
            let size = self.nodes[i].size();
            if size > 1 {
                self.sort_group(i + 1, i + size, max_iterations);
            }
            i += size;
        }

        // Build chunks: a node plus any following Or-siblings.
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        let mut i = from;
        while i < to {
            let start = i;
            i += self.nodes[i].size();
            while i < to && self.nodes[i].op() == OpType::Or {
                i += self.nodes[i].size();
            }
            chunks.push((start, i));
        }
        if chunks.len() < 2 {
            return;
        }

        let mut keyed: Vec<(usize, usize, (usize, usize))> = chunks
            .iter()
            .map(|&(s, e)| (s, e, self.chunk_cost(s, e, max_iterations)))
            .collect();
        keyed.sort_by_key(|&(_, _, cost)| cost);

        let mut span: Vec<Option<CNode>> = self
            .nodes
            .splice(from..to, std::iter::empty())
            .map(Some)
            .collect();
        let mut rebuilt = Vec::with_capacity(span.len());
        for &(s, e, _) in &keyed {
            for j in s..e {
                rebuilt.push(span[j - from].take().expect("chunks do not overlap"));
            }
        }
        self.nodes.splice(from..from, rebuilt);
    }

    /// Cost key: comparator-only chunks sort after everything else.
    fn chunk_cost(&self, from: usize, to: usize, max_iterations: usize) -> (usize, usize) {
        let mut cost = 0usize;
        let mut any_idset = false;
        let mut i = from;
        while i < to {
            match &self.nodes[i] {
                CNode::Leaf { it, .. } => {
                    if it.has_idsets() {
                        any_idset = true;
                    }
                    cost = cost.saturating_add(it.get_max_iterations(max_iterations));
                }
                CNode::Group { size, .. } => {
                    let inner = self.chunk_cost(i + 1, i + size, max_iterations);
                    if inner.0 == 0 {
                        any_idset = true;
                    }
                    cost = cost.saturating_add(inner.1);
                }
            }
            i += self.nodes[i].size();
        }
        (usize::from(!any_idset), cost)
    }

    // -----------------------------------------------------------------------
    // First-iterator invariant
    // -----------------------------------------------------------------------

    /// The first root node must be an id-set leaf that can drive the loop:
    /// never a comparator, a `Not`, an `Or`-extension or a bracket. When the
    /// current first can't, a full scan over `[0, items_count)` is
    /// prepended.
    pub fn check_first_query(&mut self, items_count: RowId) {
        let ok = match self.nodes.first() {
            Some(CNode::Leaf { op, it }) => {
                *op != OpType::Not && *op != OpType::Or && it.has_idsets()
            }
            _ => false,
        };
        if !ok {
            self.append_front(OpType::And, SelectIterator::scan(items_count));
        }
    }

    // -----------------------------------------------------------------------
    // Row evaluation
    // -----------------------------------------------------------------------

    /// Evaluate the whole boolean expression for a candidate row. The
    /// leading iterator produced the candidate and counts as matched.
    pub fn process(
        &self,
        pv: &ConstPayload<'_>,
        row_id: RowId,
        tm: &TagsMatcher,
        joins: &mut JoinMatcher<'_>,
    ) -> Result<bool> {
        self.eval_span(0, self.nodes.len(), pv, row_id, tm, joins, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_span(
        &self,
        from: usize,
        to: usize,
        pv: &ConstPayload<'_>,
        row_id: RowId,
        tm: &TagsMatcher,
        joins: &mut JoinMatcher<'_>,
        skip_leading: bool,
    ) -> Result<bool> {
        let mut acc = true;
        let mut i = from;
        let mut first = true;
        while i < to {
            let op = self.nodes[i].op();
            if first {
                let val = (skip_leading && i == 0) || self.eval_node(i, pv, row_id, tm, joins)?;
                acc = if op == OpType::Not { !val } else { val };
            } else {
                match op {
                    OpType::And => {
                        if acc {
                            acc = self.eval_node(i, pv, row_id, tm, joins)?;
                        }
                    }
                    OpType::Or => {
                        if !acc {
                            acc = self.eval_node(i, pv, row_id, tm, joins)?;
                        }
                    }
                    OpType::Not => {
                        if acc {
                            acc = !self.eval_node(i, pv, row_id, tm, joins)?;
                        }
                    }
                }
            }
            first = false;
            i += self.nodes[i].size();
        }
        Ok(acc)
    }

    fn eval_node(
        &self,
        i: usize,
        pv: &ConstPayload<'_>,
        row_id: RowId,
        tm: &TagsMatcher,
        joins: &mut JoinMatcher<'_>,
    ) -> Result<bool> {
        match &self.nodes[i] {
            CNode::Group { size, .. } => {
                self.eval_span(i + 1, i + size, pv, row_id, tm, joins, false)
            }
            CNode::Leaf { it, .. } => {
                if let Some(join_idx) = it.join_index {
                    return joins(join_idx, row_id, pv);
                }
                let mut matched = if it.has_idsets() {
                    it.contains(row_id)
                } else {
                    true
                };
                if matched {
                    for cmp in &it.comparators {
                        if !cmp.matches(pv, tm)? {
                            matched = false;
                            break;
                        }
                    }
                }
                if matched && it.distinct {
                    if let Some(field) = &it.distinct_field {
                        let values = read_field(pv, tm, field)?;
                        if !values.is_empty()
                            && values.iter().all(|v| it.distinct_seen.contains(v))
                        {
                            matched = false;
                        }
                    }
                }
                Ok(matched)
            }
        }
    }

    /// After a row matched, remember its distinct values so duplicates stop
    /// matching.
    pub fn exclude_distinct(&mut self, pv: &ConstPayload<'_>, tm: &TagsMatcher) -> Result<()> {
        for node in &mut self.nodes {
            if let CNode::Leaf { it, .. } = node {
                if it.distinct {
                    if let Some(field) = it.distinct_field.clone() {
                        for value in read_field(pv, tm, &field)? {
                            it.distinct_seen.insert(value);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_field(
    pv: &ConstPayload<'_>,
    tm: &TagsMatcher,
    field: &memdex_index::ComparatorField,
) -> Result<memdex_types::VariantArray> {
    use memdex_index::ComparatorField;
    Ok(match field {
        ComparatorField::Index(idx) => pv.get(*idx),
        ComparatorField::JsonPath(path) => {
            pv.get_by_json_path(path, tm, memdex_types::KeyValueKind::Undefined)?
        }
        ComparatorField::TagsPath(path) => pv.get_by_tags_path(path),
        ComparatorField::Composite(_) => memdex_types::VariantArray::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdex_index::{AddMode, IdSet, SelectKeyResult};
    use memdex_types::{PayloadType, PayloadValue};

    fn iter_of(ids: &[RowId]) -> SelectIterator {
        SelectIterator::new(
            SelectKeyResult::from_idset(IdSet::from_ids(ids.iter().copied(), AddMode::Ordered)),
            "idx",
        )
    }

    fn no_joins() -> impl FnMut(usize, RowId, &ConstPayload<'_>) -> Result<bool> {
        |_, _, _| Ok(false)
    }

    fn eval(c: &SelectIteratorContainer, row: RowId) -> bool {
        let ptype = PayloadType::new("t");
        let pv = PayloadValue::new(0);
        let pl = ConstPayload::new(&ptype, &pv);
        let tm = TagsMatcher::new();
        let mut joins = no_joins();
        c.process(&pl, row, &tm, &mut joins).unwrap()
    }

    #[test]
    fn test_and_or_not_evaluation() {
        // leading AND b={2,3} OR c={5}
        let mut c = SelectIteratorContainer::new();
        c.append(OpType::And, iter_of(&[1, 2, 3, 5, 8]));
        c.append(OpType::And, iter_of(&[2, 3]));
        c.append(OpType::Or, iter_of(&[5]));
        assert!(eval(&c, 2));
        assert!(eval(&c, 5));
        assert!(!eval(&c, 8));
    }

    #[test]
    fn test_not_excludes() {
        let mut c = SelectIteratorContainer::new();
        c.append(OpType::And, iter_of(&[1, 2, 3]));
        c.append(OpType::Not, iter_of(&[2]));
        assert!(eval(&c, 1));
        assert!(!eval(&c, 2));
    }

    #[test]
    fn test_bracket_grouping() {
        // leading AND (b={1} OR c={2})
        let mut c = SelectIteratorContainer::new();
        c.append(OpType::And, iter_of(&[1, 2, 3]));
        c.open_bracket(OpType::And);
        c.append(OpType::And, iter_of(&[1]));
        c.append(OpType::Or, iter_of(&[2]));
        c.close_bracket();
        assert!(eval(&c, 1));
        assert!(eval(&c, 2));
        assert!(!eval(&c, 3));
    }

    #[test]
    fn test_sort_by_cost_moves_cheapest_first() {
        let mut c = SelectIteratorContainer::new();
        c.append(OpType::And, iter_of(&[1, 2, 3, 4, 5, 6, 7, 8]));
        c.append(OpType::And, iter_of(&[1, 2]));
        c.sort_by_cost(1000);
        assert_eq!(c.leading_iterator().unwrap().get_max_iterations(1000), 2);
    }

    #[test]
    fn test_or_chunk_travels_with_its_anchor() {
        let mut c = SelectIteratorContainer::new();
        c.append(OpType::And, iter_of(&[1, 2, 3, 4, 5, 6]));
        c.append(OpType::And, iter_of(&[1, 2, 3]));
        c.append(OpType::Or, iter_of(&[9]));
        c.sort_by_cost(1000);
        // The (b OR c) chunk costs 4 total, still cheaper than 6, and the
        // Or-extension stays glued to its anchor.
        let mut costs = Vec::new();
        c.for_each_iterator(|it| costs.push(it.get_max_iterations(1000)));
        assert_eq!(costs, vec![3, 1, 6]);
        // Semantics survive the reorder: the old leading iterator still
        // filters rows the new leading iterator produces.
        assert!(eval(&c, 2));
        assert!(!eval(&c, 9));
    }

    #[test]
    fn test_check_first_query_prepends_scan() {
        let mut c = SelectIteratorContainer::new();
        c.append(OpType::Not, iter_of(&[2]));
        c.check_first_query(5);
        let lead = c.leading_iterator().unwrap();
        assert_eq!(lead.name, "-scan");
        assert_eq!(lead.get_max_iterations(usize::MAX), 5);
        assert!(eval(&c, 1));
        assert!(!eval(&c, 2));
    }
}
