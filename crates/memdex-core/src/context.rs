use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memdex_error::{MemdexError, Result};
use memdex_select::Cancellation;

/// Cancellation and deadline handle accepted by every public operation.
///
/// Long loops poll it at entry and at phase boundaries; a canceled context
/// surfaces as `canceled`, an expired deadline as `timeout`.
#[derive(Debug, Clone, Default)]
pub struct MemdexContext {
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl MemdexContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cancel flag; flip it from any thread to abort.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Attach a deadline relative to now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

impl Cancellation for MemdexContext {
    fn check(&self) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Acquire) {
                return Err(MemdexError::Canceled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MemdexError::Timeout);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_never_cancels() {
        MemdexContext::new().check().unwrap();
    }

    #[test]
    fn test_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = MemdexContext::new().with_cancel(Arc::clone(&flag));
        ctx.check().unwrap();
        flag.store(true, Ordering::Release);
        assert!(matches!(ctx.check(), Err(MemdexError::Canceled)));
    }

    #[test]
    fn test_deadline() {
        let ctx = MemdexContext::new().with_timeout(Duration::from_secs(0));
        assert!(matches!(ctx.check(), Err(MemdexError::Timeout)));
    }
}
