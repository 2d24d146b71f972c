//! Query representation for memdex.
//!
//! A [`Query`] is a boolean tree of [`QueryEntry`] predicates with explicit
//! bracket nodes, plus the sort, aggregation, join and merge clauses around
//! it. The SQL parser and the DSL front-ends both produce this form; the
//! selector consumes it.

mod ftdsl;
mod query;
mod sortexpr;
mod tree;

pub use ftdsl::{FtDslField, FtDslQuery, FtDslTerm};
pub use query::{
    AggregateEntry, JoinedQuery, Query, QueryEntries, QueryEntry, QueryJoinEntry, SortingEntry,
    UpdateEntry,
};
pub use sortexpr::{SortExpression, SortExprNode, SortValueResolver};
pub use tree::{Node, QueryTree};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operations and conditions
// ---------------------------------------------------------------------------

/// Boolean operation joining a query-tree node to its left siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpType {
    #[default]
    And,
    Or,
    Not,
}

impl OpType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
        }
    }
}

/// Condition of a single predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CondType {
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Range,
    Set,
    AllSet,
    Empty,
    Like,
    DWithin,
}

impl CondType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "IS NOT NULL",
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Range => "RANGE",
            Self::Set => "IN",
            Self::AllSet => "ALLSET",
            Self::Empty => "IS NULL",
            Self::Like => "LIKE",
            Self::DWithin => "DWITHIN",
        }
    }
}

/// Aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggType {
    Sum,
    Avg,
    Min,
    Max,
    Facet,
    Distinct,
}

impl AggType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Facet => "FACET",
            Self::Distinct => "DISTINCT",
        }
    }
}

/// Join kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    OrInner,
    Left,
    Merge,
}

/// How strictly unresolved field names are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrictMode {
    #[default]
    NotSet,
    /// Any name is allowed; unknown ones fall back to json-path comparators.
    None,
    /// Names must exist in the tagsmatcher.
    Names,
    /// Names must be declared indexes.
    Indexes,
}

/// Total-count calculation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalcTotalMode {
    #[default]
    NoTotal,
    /// Reuse a cached total when the namespace hasn't changed.
    CachedTotal,
    AccurateTotal,
}
