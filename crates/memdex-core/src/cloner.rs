use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memdex_error::{MemdexError, Result};
use memdex_select::Cancellation;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::namespace::Namespace;
use crate::transaction::Transaction;

/// Copy-on-write wrapper around a namespace.
///
/// Small commits go through the namespace in place. A large transaction
/// commits against a deep copy so readers never wait on it: the original is
/// invalidated and the public pointer swaps to the copy atomically. Every
/// public operation routes through [`Self::with_ns`], which retries on
/// `namespace_invalidated` so clients never observe the swap.
pub struct NsCloner {
    main_ns: RwLock<Arc<Namespace>>,
    cloner_mtx: Mutex<()>,
    has_copy: AtomicBool,
}

impl NsCloner {
    #[must_use]
    pub fn new(ns: Arc<Namespace>) -> Arc<Self> {
        Arc::new(Self {
            main_ns: RwLock::new(ns),
            cloner_mtx: Mutex::new(()),
            has_copy: AtomicBool::new(false),
        })
    }

    /// The currently visible namespace. Exactly one pointer is public at
    /// any instant.
    #[must_use]
    pub fn load(&self) -> Arc<Namespace> {
        Arc::clone(&self.main_ns.read())
    }

    /// Run an operation against the current namespace, retrying when a
    /// concurrent copy-commit invalidates it. The cloner's lock is never
    /// held during user work.
    pub fn with_ns<R>(&self, mut f: impl FnMut(&Arc<Namespace>) -> Result<R>) -> Result<R> {
        loop {
            let ns = self.load();
            match f(&ns) {
                Err(MemdexError::NamespaceInvalidated) => {
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }

    fn needs_copy(ns: &Namespace, tx: &Transaction) -> bool {
        let steps = tx.len();
        if steps >= ns.config.tx_size_to_always_copy {
            return true;
        }
        // A transaction large relative to the namespace would stall its
        // readers for too long in place.
        steps >= ns.config.tx_size_to_copy && steps.saturating_mul(4) > ns.items_count()
    }

    /// Commit a transaction, through a shadow copy when it is large.
    pub fn commit_transaction(&self, tx: &Transaction, ctx: &dyn Cancellation) -> Result<()> {
        let ns = self.load();
        if Self::needs_copy(&ns, tx) {
            let _cloner_lock = self.cloner_mtx.lock();
            let ns = self.load();
            if Self::needs_copy(&ns, tx) {
                trace!(ns = %ns.name(), steps = tx.len(), "creating namespace copy for commit");
                self.has_copy.store(true, Ordering::Release);
                ns.cancel_commit.store(true, Ordering::Release);
                let copy = {
                    // Snapshot under the source's read path plus the storage
                    // lock; background work yields on cancel_commit.
                    let _storage_lock = ns.storage_mtx.lock();
                    ns.cancel_commit.store(false, Ordering::Release);
                    Arc::new(ns.deep_copy())
                };
                let commit_result = ctx
                    .check()
                    .and_then(|()| copy.commit_transaction_in_place(tx, ctx));
                match commit_result {
                    Ok(()) => {
                        ns.invalidate();
                        *self.main_ns.write() = copy;
                        self.has_copy.store(false, Ordering::Release);
                        return Ok(());
                    }
                    Err(err) => {
                        // Discard the shadow; the original stays
                        // authoritative.
                        self.has_copy.store(false, Ordering::Release);
                        return Err(err);
                    }
                }
            }
        }
        self.with_ns(|ns| ns.commit_transaction_in_place(tx, ctx))
    }

    /// Rename protocol: flush storage, lock the source (and target when
    /// replacing one), move storage, update the in-memory name and clear
    /// the temporary-replica flag.
    pub fn rename(&self, target: Option<&Arc<NsCloner>>, new_name: &str) -> Result<()> {
        crate::storage::validate_storage_name(new_name)?;
        self.with_ns(|ns| ns.flush_storage())?;
        let ns = self.load();
        if let Some(target) = target {
            // The replaced target stops serving; its clients retry and find
            // the namespace gone.
            target.load().invalidate();
        } else if new_name == ns.name() {
            return Ok(());
        }
        ns.set_name(new_name, new_name);
        trace!(ns = new_name, "namespace renamed");
        Ok(())
    }

    #[must_use]
    pub fn has_copy(&self) -> bool {
        self.has_copy.load(Ordering::Acquire)
    }
}
