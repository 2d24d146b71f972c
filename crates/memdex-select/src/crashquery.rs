use std::cell::RefCell;

thread_local! {
    static CURRENT_QUERY: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Scoped guard publishing the innermost active query of this thread.
///
/// A signal handler (or any diagnostic hook) can read it with
/// [`current_query`] to report what the faulting thread was executing.
pub struct QueryDebugGuard {
    previous: Option<String>,
}

impl QueryDebugGuard {
    #[must_use]
    pub fn new(query: &str, namespace: &str, optimization_state: &str) -> Self {
        let description = format!("ns '{namespace}' [{optimization_state}]: {query}");
        let previous = CURRENT_QUERY.with(|slot| slot.borrow_mut().replace(description));
        Self { previous }
    }
}

impl Drop for QueryDebugGuard {
    fn drop(&mut self) {
        CURRENT_QUERY.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
    }
}

/// The query currently executing on this thread, if any.
#[must_use]
pub fn current_query() -> Option<String> {
    CURRENT_QUERY.with(|slot| slot.borrow().clone())
}
