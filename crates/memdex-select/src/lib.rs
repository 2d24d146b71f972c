//! Query execution for memdex.
//!
//! The pipeline: a [`Query`](memdex_query::Query) is preprocessed against a
//! namespace snapshot ([`NsView`]), compiled into a
//! [`SelectIteratorContainer`] ordered by cost, and driven by the
//! [`Selector`] merge loop into [`QueryResults`], with the sort back-end and
//! aggregators applied on the way out.

mod aggregator;
mod cache;
mod container;
mod crashquery;
mod iterator;
mod joins;
mod nsview;
mod preprocessor;
mod results;
mod selector;
mod sorting;

pub use aggregator::{Aggregator, FacetSortKey};
pub use cache::QueryCountCache;
pub use container::{JoinMatcher, SelectIteratorContainer};
pub use crashquery::{current_query, QueryDebugGuard};
pub use iterator::{IterOrder, SelectIterator};
pub use joins::{
    JoinedSelector, PreResultData, MAX_ITERATIONS_FOR_PRERESULT_STORE_VALUES,
};
pub use nsview::NsView;
pub use preprocessor::QueryPreprocessor;
pub use results::{AggregationResult, FacetResult, NsContext, QueryResults};
pub use selector::Selector;
pub use sorting::{
    apply_forced_sort, apply_general_sort, set_limit_and_offset, ItemComparator,
    ResolvedSortEntry, SortKind, SortingContext,
};

use memdex_error::Result;

/// Cooperative cancellation polled at loop entries and phase boundaries.
pub trait Cancellation {
    /// `Err(canceled | timeout)` once the caller gave up.
    fn check(&self) -> Result<()>;
}

/// A context that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCanceled;

impl Cancellation for NeverCanceled {
    fn check(&self) -> Result<()> {
        Ok(())
    }
}
