use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memdex_error::{MemdexError, Result};
use memdex_types::{Lsn, LsnPair};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::database::{Memdex, StorageOpts};
use crate::context::MemdexContext;
use crate::observer::{UpdatesFilters, UpdatesObserver};
use crate::wal::{WalRecord, WalRecordKind};

/// Replication consumer configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Namespaces to replicate; empty means all.
    pub namespaces: Vec<String>,
    /// Backoff between retries after a transient failure.
    pub retry_backoff: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Per-namespace replication status, surfaced to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
    Fatal,
}

struct Event {
    ns: String,
    record: WalRecord,
}

struct ChannelObserver {
    tx: Mutex<Sender<Event>>,
}

impl UpdatesObserver for ChannelObserver {
    fn on_wal_record(&self, ns: &str, _lsn: LsnPair, record: &WalRecord) {
        let _ = self.tx.lock().send(Event {
            ns: ns.to_owned(),
            record: record.clone(),
        });
    }
}

struct ReplicatorInner {
    master: Memdex,
    slave: Memdex,
    config: ReplicationConfig,
    synced: Mutex<HashSet<String>>,
    /// Updates received for a namespace that is not yet synced.
    pended: Mutex<HashMap<String, Vec<WalRecord>>>,
    /// Last master LSN applied per namespace.
    last_applied: Mutex<HashMap<String, Lsn>>,
    /// Staged transactions keyed by (namespace, tx id).
    transactions: Mutex<HashMap<(String, u64), Vec<WalRecord>>>,
    /// Per-namespace apply-error dedup: count plus the first error text.
    errors: Mutex<HashMap<String, (usize, String)>>,
    status: Mutex<HashMap<String, ReplicationStatus>>,
    stop: Arc<AtomicBool>,
}

/// Master->slave replication consumer.
///
/// Subscribes to the master's update stream and applies WAL records to the
/// slave on a dedicated worker thread. Namespaces that lag past the
/// master's WAL ring force-sync from a full dump; everything else catches
/// up record by record.
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
    observer: Arc<dyn UpdatesObserver>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Replicator {
    /// Subscribe to `master` and start replicating into `slave`.
    #[must_use]
    pub fn start(master: &Memdex, slave: &Memdex, config: ReplicationConfig) -> Self {
        let (tx, rx) = channel();
        let observer: Arc<dyn UpdatesObserver> = Arc::new(ChannelObserver { tx: Mutex::new(tx) });
        master.subscribe_updates(
            Arc::clone(&observer),
            UpdatesFilters {
                namespaces: config.namespaces.clone(),
            },
        );
        let inner = Arc::new(ReplicatorInner {
            master: master.clone(),
            slave: slave.clone(),
            config,
            synced: Mutex::new(HashSet::new()),
            pended: Mutex::new(HashMap::new()),
            last_applied: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            status: Mutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("memdex-replicator".to_owned())
            .spawn(move || worker_inner.run(rx))
            .expect("spawn replicator thread");
        Self {
            inner,
            observer,
            worker: Some(worker),
        }
    }

    /// Stop the consumer and detach from the master.
    pub fn stop(mut self) {
        self.inner.master.unsubscribe_updates(&self.observer);
        self.inner.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    #[must_use]
    pub fn status(&self, ns: &str) -> ReplicationStatus {
        self.inner
            .status
            .lock()
            .get(ns)
            .copied()
            .unwrap_or_default()
    }

    /// Apply-error statistics: `(count, first error)` per namespace.
    #[must_use]
    pub fn error_stats(&self, ns: &str) -> Option<(usize, String)> {
        self.inner.errors.lock().get(ns).cloned()
    }

    #[must_use]
    pub fn last_applied_lsn(&self, ns: &str) -> Lsn {
        self.inner
            .last_applied
            .lock()
            .get(ns)
            .copied()
            .unwrap_or(Lsn::EMPTY)
    }

    /// Block until the slave caught up with the master's current WAL
    /// position for `ns`, or the timeout expires.
    pub fn wait_synced(&self, ns: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let target = self
                .inner
                .master
                .cloner(ns)
                .map(|cloner| cloner.load().last_lsn());
            if let Ok(target) = target {
                if self.inner.synced.lock().contains(ns) && self.last_applied_lsn(ns) >= target {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.inner.master.unsubscribe_updates(&self.observer);
        self.inner.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ReplicatorInner {
    fn run(self: Arc<Self>, rx: Receiver<Event>) {
        // Initial sync of every replicated namespace.
        self.sync_all();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => self.sync_all(),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn replicated(&self, ns: &str) -> bool {
        self.config.namespaces.is_empty() || self.config.namespaces.iter().any(|n| n == ns)
    }

    fn sync_all(&self) {
        for ns in self.master.enum_namespaces(None) {
            if !self.replicated(&ns) {
                continue;
            }
            if !self.synced.lock().contains(&ns) {
                self.try_sync(&ns);
            }
        }
    }

    fn handle_event(&self, event: Event) {
        let ns = event.ns;
        if !self.replicated(&ns) {
            return;
        }
        if !self.synced.lock().contains(&ns) {
            self.pended.lock().entry(ns.clone()).or_default().push(event.record);
            self.try_sync(&ns);
            return;
        }
        if let Err(err) = self.apply(&ns, &event.record) {
            self.on_apply_error(&ns, err);
        }
    }

    fn try_sync(&self, ns: &str) {
        self.status
            .lock()
            .insert(ns.to_owned(), ReplicationStatus::Syncing);
        match self.sync_namespace(ns) {
            Ok(()) => {
                self.synced.lock().insert(ns.to_owned());
                self.status
                    .lock()
                    .insert(ns.to_owned(), ReplicationStatus::Synced);
                debug!(ns, "slave namespace synced");
            }
            Err(err) => self.on_apply_error(ns, err),
        }
    }

    /// Catch up one namespace: WAL replay when the master still holds the
    /// tail, full resync otherwise.
    fn sync_namespace(&self, ns: &str) -> Result<()> {
        let master = self.master.cloner(ns)?.load();
        // A fresh consumer resumes from the slave's persisted position.
        let last = match self.last_applied.lock().get(ns).copied() {
            Some(lsn) => lsn,
            None => self
                .slave
                .cloner(ns)
                .map(|cloner| cloner.load().last_upstream_lsn())
                .unwrap_or(Lsn::EMPTY),
        };
        let slave_has_ns = self.slave.cloner(ns).is_ok();
        match master.wal_after(last) {
            Some(records) if slave_has_ns => {
                trace!(ns, from = last.0, count = records.len(), "wal catch-up");
                for record in &records {
                    self.apply(ns, record)?;
                }
            }
            _ => {
                debug!(ns, "wal tail lost or namespace missing, forcing full sync");
                self.force_sync(ns)?;
            }
        }
        // Apply updates that arrived while syncing.
        loop {
            let pended = self.pended.lock().remove(ns).unwrap_or_default();
            if pended.is_empty() {
                return Ok(());
            }
            let applied = self
                .last_applied
                .lock()
                .get(ns)
                .copied()
                .unwrap_or(Lsn::EMPTY);
            for record in pended {
                if record.lsn > applied {
                    self.apply(ns, &record)?;
                }
            }
        }
    }

    /// Drop and rebuild the slave namespace from a full master dump, then
    /// replay the WAL tail written since the dump.
    fn force_sync(&self, ns: &str) -> Result<()> {
        let ctx = MemdexContext::new();
        let master = self.master.cloner(ns)?.load();
        let defs = master.index_defs();
        let (items, dump_lsn) = master.dump_cjson();

        if self.slave.enum_namespaces(None).iter().any(|n| n == ns) {
            self.slave.drop_namespace(ns, &ctx)?;
        }
        self.slave.open_namespace(ns, StorageOpts::default(), &ctx)?;
        for def in defs {
            self.slave.add_index(ns, def, &ctx)?;
        }
        let slave = self.slave.cloner(ns)?;
        for data in items {
            slave.with_ns(|sns| {
                sns.apply_wal_record(&WalRecord {
                    kind: WalRecordKind::ItemUpsert,
                    lsn: dump_lsn,
                    data: data.clone(),
                    tx_id: 0,
                })
                .map(|_| ())
            })?;
        }
        self.last_applied.lock().insert(ns.to_owned(), dump_lsn);

        // Replay anything the master wrote since the dump.
        let tail = self
            .master
            .cloner(ns)?
            .load()
            .wal_after(dump_lsn)
            .ok_or_else(|| {
                MemdexError::UpdateReplication("wal tail lost during force sync".into())
            })?;
        for record in &tail {
            self.apply(ns, record)?;
        }
        Ok(())
    }

    /// Apply one record to the slave, staging transaction steps until their
    /// commit arrives.
    fn apply(&self, ns: &str, record: &WalRecord) -> Result<()> {
        match record.kind {
            WalRecordKind::TxBegin => {
                self.transactions
                    .lock()
                    .insert((ns.to_owned(), record.tx_id), Vec::new());
            }
            WalRecordKind::TxStep => {
                self.transactions
                    .lock()
                    .entry((ns.to_owned(), record.tx_id))
                    .or_default()
                    .push(record.clone());
            }
            WalRecordKind::TxCommit => {
                let steps = self
                    .transactions
                    .lock()
                    .remove(&(ns.to_owned(), record.tx_id))
                    .unwrap_or_default();
                // All steps flush under one write lock on the slave side.
                let slave = self.slave.cloner(ns)?;
                slave.with_ns(|sns| {
                    sns.apply_tx_records(&steps)?;
                    Ok(())
                })?;
            }
            WalRecordKind::ForceSync => {
                self.synced.lock().remove(ns);
                self.force_sync(ns)?;
            }
            _ => {
                let slave = self.slave.cloner(ns)?;
                slave.with_ns(|sns| sns.apply_wal_record(record).map(|_| ()))?;
            }
        }
        // Staged steps don't advance the applied position: a consumer that
        // restarts mid-transaction must replay them from before TxBegin.
        // Duplicate deliveries must not move it backwards either.
        if !matches!(
            record.kind,
            WalRecordKind::TxBegin | WalRecordKind::TxStep
        ) {
            let mut last_applied = self.last_applied.lock();
            let entry = last_applied.entry(ns.to_owned()).or_insert(Lsn::EMPTY);
            *entry = (*entry).max(record.lsn);
        }
        Ok(())
    }

    fn on_apply_error(&self, ns: &str, err: MemdexError) {
        let transient = err.is_transient();
        {
            let mut errors = self.errors.lock();
            let entry = errors
                .entry(ns.to_owned())
                .or_insert_with(|| (0, err.to_string()));
            entry.0 += 1;
            if entry.0 == 1 {
                entry.1 = err.to_string();
            }
        }
        if transient {
            warn!(ns, %err, "transient replication error, will retry");
            self.synced.lock().remove(ns);
            self.status
                .lock()
                .insert(ns.to_owned(), ReplicationStatus::Error);
            std::thread::sleep(self.config.retry_backoff);
        } else {
            error!(ns, %err, "fatal replication error, namespace halted");
            self.synced.lock().remove(ns);
            self.status
                .lock()
                .insert(ns.to_owned(), ReplicationStatus::Fatal);
        }
    }
}
