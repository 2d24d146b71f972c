use memdex_index::Index;
use memdex_query::StrictMode;
use memdex_types::{PayloadType, PayloadValue, TagsMatcher};

use crate::cache::QueryCountCache;

/// A read-locked view of one namespace, everything the selector needs.
///
/// The owning namespace constructs this under its read lock; the borrow
/// keeps the snapshot consistent for the whole select.
pub struct NsView<'a> {
    pub name: &'a str,
    pub payload_type: &'a PayloadType,
    pub tags_matcher: &'a TagsMatcher,
    pub items: &'a [PayloadValue],
    pub free_count: usize,
    pub indexes: &'a [Index],
    /// Whether the namespace's background optimization finished building
    /// sort orders.
    pub sort_orders_built: bool,
    pub strict_mode: StrictMode,
    pub query_cache: Option<&'a QueryCountCache>,
    /// Mutation counter; stamps query-cache entries.
    pub generation: u64,
}

impl NsView<'_> {
    /// Live (non-tombstoned) row count.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.items.len() - self.free_count
    }

    /// Case-insensitive index lookup.
    #[must_use]
    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.indexes
            .iter()
            .position(|idx| idx.name().eq_ignore_ascii_case(name))
    }
}
