use std::sync::Arc;

use memdex_types::LsnPair;
use parking_lot::RwLock;

use crate::wal::WalRecord;

/// Receives every WAL record the moment it is appended.
///
/// The namespace notifies under its write lock, so an observer that reads
/// the namespace afterwards always sees at least the notified version.
pub trait UpdatesObserver: Send + Sync {
    fn on_wal_record(&self, ns: &str, lsn: LsnPair, record: &WalRecord);
}

/// Filters restricting which namespaces an observer hears about. Empty
/// means everything.
#[derive(Debug, Clone, Default)]
pub struct UpdatesFilters {
    pub namespaces: Vec<String>,
}

impl UpdatesFilters {
    #[must_use]
    pub fn matches(&self, ns: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == ns)
    }

    /// Merge another subscription's filters; widening to "everything" when
    /// either side is unfiltered.
    pub fn merge(&mut self, other: &UpdatesFilters) {
        if self.namespaces.is_empty() || other.namespaces.is_empty() {
            self.namespaces.clear();
            return;
        }
        for ns in &other.namespaces {
            if !self.namespaces.contains(ns) {
                self.namespaces.push(ns.clone());
            }
        }
    }
}

/// Process-wide observer registry shared by every namespace of a database.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<(Arc<dyn UpdatesObserver>, UpdatesFilters)>>,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn UpdatesObserver>, filters: UpdatesFilters) {
        let mut observers = self.observers.write();
        // Re-subscribing merges the filters instead of duplicating.
        for (existing, existing_filters) in observers.iter_mut() {
            if Arc::ptr_eq(existing, &observer) {
                existing_filters.merge(&filters);
                return;
            }
        }
        observers.push((observer, filters));
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn UpdatesObserver>) {
        self.observers
            .write()
            .retain(|(existing, _)| !Arc::ptr_eq(existing, observer));
    }

    pub fn notify(&self, ns: &str, lsn: LsnPair, record: &WalRecord) {
        for (observer, filters) in self.observers.read().iter() {
            if filters.matches(ns) {
                observer.on_wal_record(ns, lsn, record);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}
