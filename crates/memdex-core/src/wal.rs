use std::collections::VecDeque;

use memdex_types::Lsn;
use serde::{Deserialize, Serialize};

/// Default capacity of the per-namespace WAL ring.
pub const DEFAULT_WAL_SIZE: usize = 4_000_000;

/// Kind of one WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordKind {
    ItemInsert,
    ItemUpdate,
    ItemUpsert,
    ItemDelete,
    Truncate,
    IndexAdd,
    IndexUpdate,
    IndexDrop,
    MetaPut,
    TxBegin,
    TxStep,
    TxCommit,
    /// Marker forcing slaves into a full resync.
    ForceSync,
}

/// One write-ahead record. Item payloads are CJSON (with the embedded tag
/// dictionary delta), so tagsmatcher divergence between master and slave is
/// resolvable at apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub lsn: Lsn,
    pub data: Vec<u8>,
    /// Open transaction this step belongs to, 0 outside transactions.
    pub tx_id: u64,
}

/// A bounded ring of WAL records indexed by LSN.
///
/// LSNs are dense and monotonic; once the ring is full the oldest records
/// fall off, and a slave that lags past the ring's head must force-sync.
#[derive(Debug, Clone)]
pub struct WalRing {
    records: VecDeque<WalRecord>,
    capacity: usize,
    next_lsn: Lsn,
}

impl WalRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            next_lsn: Lsn(0),
        }
    }

    /// LSN of the next record to be appended.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// LSN of the most recent record, or empty.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.0 - 1)
    }

    /// Oldest LSN still held by the ring.
    #[must_use]
    pub fn first_lsn(&self) -> Lsn {
        self.records.front().map_or(self.next_lsn, |r| r.lsn)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record, assigning the next LSN.
    pub fn append(&mut self, kind: WalRecordKind, data: Vec<u8>, tx_id: u64) -> Lsn {
        let lsn = self.next_lsn;
        self.next_lsn = self.next_lsn.next();
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(WalRecord {
            kind,
            lsn,
            data,
            tx_id,
        });
        lsn
    }

    /// Whether a catch-up from `lsn` (exclusive) is still possible, or the
    /// slave must force-sync.
    #[must_use]
    pub fn is_available(&self, lsn: Lsn) -> bool {
        lsn.next() >= self.first_lsn()
    }

    /// One record by LSN, if the ring still holds it.
    #[must_use]
    pub fn get(&self, lsn: Lsn) -> Option<&WalRecord> {
        let first = self.first_lsn();
        if lsn < first || lsn >= self.next_lsn {
            return None;
        }
        self.records.get((lsn.0 - first.0) as usize)
    }

    /// Records strictly after `lsn`, oldest first.
    #[must_use]
    pub fn read_after(&self, lsn: Lsn) -> Vec<WalRecord> {
        self.records
            .iter()
            .filter(|r| r.lsn > lsn)
            .cloned()
            .collect()
    }
}

impl Default for WalRing {
    fn default() -> Self {
        Self::new(DEFAULT_WAL_SIZE)
    }
}
