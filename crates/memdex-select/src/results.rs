use std::collections::HashMap;

use memdex_types::{ItemRef, PayloadType, RowId, TagsMatcher};
use serde::Serialize;

/// Aggregation output attached to query results.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregationResult {
    #[serde(rename = "type")]
    pub agg_type: String,
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<FacetResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub distincts: Vec<String>,
}

/// One facet bucket.
#[derive(Debug, Clone, Serialize)]
pub struct FacetResult {
    pub values: Vec<String>,
    pub count: usize,
}

/// Encoding context of one namespace contributing to a result set.
#[derive(Debug, Clone)]
pub struct NsContext {
    pub payload_type: PayloadType,
    pub tags_matcher: TagsMatcher,
    pub select_filter: Vec<String>,
}

/// The ordered output of a select.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub items: Vec<ItemRef>,
    /// Joined rows keyed by left row id, one map per join query.
    pub joined: Vec<HashMap<RowId, Vec<ItemRef>>>,
    pub aggregation_results: Vec<AggregationResult>,
    pub total_count: usize,
    pub have_rank: bool,
    pub need_output_rank: bool,
    pub explain: Option<String>,
    pub namespaces: Vec<NsContext>,
}

impl QueryResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Joined rows of `item` for join query `join_idx`.
    #[must_use]
    pub fn joined_rows(&self, join_idx: usize, row_id: RowId) -> &[ItemRef] {
        self.joined
            .get(join_idx)
            .and_then(|m| m.get(&row_id))
            .map_or(&[], Vec::as_slice)
    }
}
