use std::fmt;
use std::fmt::Write as _;

use memdex_types::{Variant, VariantArray, NOT_SET};
use smallvec::SmallVec;

use crate::tree::QueryTree;
use crate::{AggType, CalcTotalMode, CondType, JoinType, OpType, StrictMode};

// ---------------------------------------------------------------------------
// Query entries
// ---------------------------------------------------------------------------

/// One predicate of a query: `index CONDITION values`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    /// Index or field name as written in the query.
    pub index: String,
    /// Resolved index position, `NOT_SET` until the preprocessor runs,
    /// `SET_BY_JSON_PATH` for non-indexed fields.
    pub idx_no: i32,
    pub condition: CondType,
    pub values: VariantArray,
    /// Marker entry produced from a `Distinct` aggregation.
    pub distinct: bool,
    /// Position in the joined-query list when this entry is a join
    /// placeholder, `NOT_SET` otherwise.
    pub join_index: i32,
}

impl Default for QueryEntry {
    fn default() -> Self {
        Self {
            index: String::new(),
            idx_no: NOT_SET,
            condition: CondType::Any,
            values: VariantArray::new(),
            distinct: false,
            join_index: NOT_SET,
        }
    }
}

impl QueryEntry {
    #[must_use]
    pub fn new(condition: CondType, index: impl Into<String>, values: VariantArray) -> Self {
        Self {
            index: index.into(),
            idx_no: NOT_SET,
            condition,
            values,
            distinct: false,
            join_index: NOT_SET,
        }
    }

    #[must_use]
    pub fn join(join_index: i32) -> Self {
        Self {
            join_index,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_join(&self) -> bool {
        self.join_index != NOT_SET
    }
}

/// The boolean predicate tree of a query.
pub type QueryEntries = QueryTree<QueryEntry>;

// ---------------------------------------------------------------------------
// Clauses
// ---------------------------------------------------------------------------

/// One `ORDER BY` entry: an expression (usually a plain field name) plus
/// direction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortingEntry {
    pub expression: String,
    pub desc: bool,
    /// Resolved index position, filled by the selector.
    pub index: i32,
}

impl SortingEntry {
    #[must_use]
    pub fn new(expression: impl Into<String>, desc: bool) -> Self {
        Self {
            expression: expression.into(),
            desc,
            index: NOT_SET,
        }
    }
}

/// One aggregation request.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub agg_type: AggType,
    pub fields: SmallVec<[String; 1]>,
    pub sorting: Vec<SortingEntry>,
    pub limit: usize,
    pub offset: usize,
}

impl AggregateEntry {
    #[must_use]
    pub fn new(agg_type: AggType, fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            agg_type,
            fields: fields.into_iter().collect(),
            sorting: Vec::new(),
            limit: usize::MAX,
            offset: 0,
        }
    }
}

/// One field assignment of a query-form `UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    pub column: String,
    pub values: VariantArray,
}

/// One ON condition of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryJoinEntry {
    pub op: OpType,
    pub condition: CondType,
    /// Field in the left (outer) namespace.
    pub left_field: String,
    /// Field in the right (joined) namespace.
    pub right_field: String,
}

/// A joined sub-query with its kind and ON conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedQuery {
    pub join_type: JoinType,
    pub query: Query,
    pub on: Vec<QueryJoinEntry>,
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A complete query against one namespace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub namespace: String,
    pub entries: QueryEntries,
    pub aggregations: Vec<AggregateEntry>,
    pub sorting_entries: Vec<SortingEntry>,
    /// Explicit value order for the first sort entry.
    pub forced_sort_order: Vec<Variant>,
    pub join_queries: Vec<JoinedQuery>,
    pub merge_queries: Vec<Query>,
    /// Groups of field names that must match at equal array positions.
    pub equal_positions: Vec<Vec<String>>,
    pub start: usize,
    pub count: usize,
    pub calc_total: CalcTotalMode,
    pub strict_mode: StrictMode,
    /// Columns to return; empty means all.
    pub select_filter: Vec<String>,
    /// Field assignments applied by query-form `UPDATE`.
    pub update_fields: Vec<UpdateEntry>,
    pub with_rank: bool,
    pub explain: bool,
}

impl Query {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            count: usize::MAX,
            ..Self::default()
        }
    }

    /// Append a predicate with `AND`.
    #[must_use]
    pub fn where_cond(
        mut self,
        index: impl Into<String>,
        condition: CondType,
        values: impl IntoIterator<Item = Variant>,
    ) -> Self {
        self.entries.append(
            OpType::And,
            QueryEntry::new(condition, index, values.into_iter().collect()),
        );
        self
    }

    /// Append a predicate with an explicit operation.
    #[must_use]
    pub fn op_where(
        mut self,
        op: OpType,
        index: impl Into<String>,
        condition: CondType,
        values: impl IntoIterator<Item = Variant>,
    ) -> Self {
        self.entries.append(
            op,
            QueryEntry::new(condition, index, values.into_iter().collect()),
        );
        self
    }

    #[must_use]
    pub fn open_bracket(mut self, op: OpType) -> Self {
        self.entries.open_bracket(op);
        self
    }

    #[must_use]
    pub fn close_bracket(mut self) -> Self {
        // Bracket balance is validated when the query is executed.
        let _ = self.entries.close_bracket();
        self
    }

    #[must_use]
    pub fn sort(mut self, expression: impl Into<String>, desc: bool) -> Self {
        self.sorting_entries.push(SortingEntry::new(expression, desc));
        self
    }

    #[must_use]
    pub fn forced_sort(mut self, values: impl IntoIterator<Item = Variant>) -> Self {
        self.forced_sort_order = values.into_iter().collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub fn offset(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    #[must_use]
    pub fn aggregate(mut self, entry: AggregateEntry) -> Self {
        self.aggregations.push(entry);
        self
    }

    /// Attach a joined sub-query; a placeholder entry keeps its position in
    /// the boolean tree for `Inner`/`OrInner` joins.
    #[must_use]
    pub fn join(mut self, joined: JoinedQuery) -> Self {
        let join_index = self.join_queries.len() as i32;
        match joined.join_type {
            JoinType::Inner => {
                self.entries.append(OpType::And, QueryEntry::join(join_index));
            }
            JoinType::OrInner => {
                self.entries.append(OpType::Or, QueryEntry::join(join_index));
            }
            JoinType::Left | JoinType::Merge => {}
        }
        self.join_queries.push(joined);
        self
    }

    #[must_use]
    pub fn merge(mut self, query: Query) -> Self {
        self.merge_queries.push(query);
        self
    }

    #[must_use]
    pub fn req_total(mut self, mode: CalcTotalMode) -> Self {
        self.calc_total = mode;
        self
    }

    /// Add a field assignment for query-form `UPDATE`.
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, values: impl IntoIterator<Item = Variant>) -> Self {
        self.update_fields.push(UpdateEntry {
            column: column.into(),
            values: values.into_iter().collect(),
        });
        self
    }

    /// Normalized signature used as the query-cache key. Excludes limit,
    /// offset and total mode so that paging reuses the cached count.
    #[must_use]
    pub fn cache_signature(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "ns:{};", self.namespace);
        self.entries.for_each_leaf(|entry, op| {
            let _ = write!(
                out,
                "{} {} {} [",
                op.as_str(),
                entry.index,
                entry.condition.as_str()
            );
            for v in &entry.values {
                let _ = write!(out, "{v:?},");
            }
            let _ = write!(out, "];");
        });
        for merged in &self.merge_queries {
            let _ = write!(out, "merge({});", merged.cache_signature());
        }
        out
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT * FROM {}", self.namespace)?;
        let mut first = true;
        let mut where_part = String::new();
        self.entries.for_each_leaf(|entry, op| {
            if !first || op != OpType::And {
                let _ = write!(where_part, " {}", op.as_str());
            }
            first = false;
            if entry.is_join() {
                let _ = write!(where_part, " <join #{}>", entry.join_index);
            } else {
                let _ = write!(
                    where_part,
                    " {} {} {:?}",
                    entry.index,
                    entry.condition.as_str(),
                    entry.values.as_slice()
                );
            }
        });
        if !where_part.is_empty() {
            write!(f, " WHERE{where_part}")?;
        }
        for (i, s) in self.sorting_entries.iter().enumerate() {
            write!(
                f,
                "{} {}{}",
                if i == 0 { " ORDER BY" } else { "," },
                s.expression,
                if s.desc { " DESC" } else { "" }
            )?;
        }
        if self.start > 0 {
            write!(f, " OFFSET {}", self.start)?;
        }
        if self.count != usize::MAX {
            write!(f, " LIMIT {}", self.count)?;
        }
        Ok(())
    }
}
