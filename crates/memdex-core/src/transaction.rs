use memdex_error::{MemdexError, Result};
use memdex_query::Query;

use crate::namespace::ItemModifyMode;

/// One buffered transaction step.
#[derive(Debug, Clone)]
pub enum TxStep {
    Modify { json: String, mode: ItemModifyMode },
    /// Query-form update/delete, resolved to rows at commit time.
    ModifyQuery { query: Query, delete: bool },
}

/// A per-namespace transaction: steps accumulate client-side and apply
/// atomically at commit, in insertion order.
#[derive(Debug, Clone)]
pub struct Transaction {
    ns_name: String,
    steps: Vec<TxStep>,
    finished: bool,
}

impl Transaction {
    #[must_use]
    pub fn new(ns_name: impl Into<String>) -> Self {
        Self {
            ns_name: ns_name.into(),
            steps: Vec::new(),
            finished: false,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.ns_name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn steps(&self) -> &[TxStep] {
        &self.steps
    }

    fn push(&mut self, step: TxStep) -> Result<()> {
        if self.finished {
            return Err(MemdexError::logic("transaction is already finished"));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn insert_json(&mut self, json: impl Into<String>) -> Result<()> {
        self.push(TxStep::Modify {
            json: json.into(),
            mode: ItemModifyMode::Insert,
        })
    }

    pub fn update_json(&mut self, json: impl Into<String>) -> Result<()> {
        self.push(TxStep::Modify {
            json: json.into(),
            mode: ItemModifyMode::Update,
        })
    }

    pub fn upsert_json(&mut self, json: impl Into<String>) -> Result<()> {
        self.push(TxStep::Modify {
            json: json.into(),
            mode: ItemModifyMode::Upsert,
        })
    }

    pub fn delete_json(&mut self, json: impl Into<String>) -> Result<()> {
        self.push(TxStep::Modify {
            json: json.into(),
            mode: ItemModifyMode::Delete,
        })
    }

    /// Queue a query-form `DELETE`.
    pub fn delete_query(&mut self, query: Query) -> Result<()> {
        self.push(TxStep::ModifyQuery {
            query,
            delete: true,
        })
    }

    /// Queue a query-form `UPDATE`; the query carries its field
    /// assignments.
    pub fn update_query(&mut self, query: Query) -> Result<()> {
        if query.update_fields.is_empty() {
            return Err(MemdexError::params("update query has no field assignments"));
        }
        self.push(TxStep::ModifyQuery {
            query,
            delete: false,
        })
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }
}
