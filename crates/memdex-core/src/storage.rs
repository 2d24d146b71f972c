use std::collections::HashMap;

use memdex_error::{MemdexError, Result};
use parking_lot::Mutex;

/// One durable mutation, queued by the namespace under its write lock and
/// flushed in batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

/// Pluggable key-value durability layer.
///
/// Memdex keeps data in memory; storage is only an append-only change-record
/// sink plus a bulk load source at namespace open. The vendor adapters
/// (LSM-tree engines) live outside the core; this trait pins their surface.
pub trait Storage: Send + Sync {
    /// Apply a batch of change records.
    fn write(&self, records: Vec<ChangeRecord>) -> Result<()>;

    /// Read one key.
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterate every `(key, value)` pair with the given prefix.
    fn load_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Flush buffered writes.
    fn flush(&self) -> Result<()>;

    /// Destroy the backing store.
    fn destroy(&self) -> Result<()>;
}

/// In-memory storage engine, the default for embedded use and tests.
#[derive(Debug, Default)]
pub struct MemStorage {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl Storage for MemStorage {
    fn write(&self, records: Vec<ChangeRecord>) -> Result<()> {
        let mut data = self.data.lock();
        for record in records {
            match record {
                ChangeRecord::Put { key, value } => {
                    data.insert(key, value);
                }
                ChangeRecord::Remove { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn load_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.lock();
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }
}

/// Validate a storage directory component: `[A-Za-z0-9_-]+`.
pub fn validate_storage_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(MemdexError::params(format!(
            "invalid storage name '{name}': only [A-Za-z0-9_-]+ is allowed"
        )));
    }
    Ok(())
}
