//! # Transactions
//!
//! A [`Transaction`] is a client-side buffer of mutations. Nothing touches a
//! file until the session commits it; the commit path then runs in three
//! phases under the session's global commit lock:
//!
//! 1. **snapshot**: record counts of every type store and the full bytes of
//!    every targeted record are appended to the log and synced;
//! 2. **apply**: mutations run against the data stores, with index node
//!    stores in deferred-write mode and heap updates forced to relocate so
//!    logged images stay restorable;
//! 3. **publish**: deferred index writes flush, files sync, the log is
//!    deleted. Deleting the log is the durability point.
//!
//! A failure in phase 2 or 3 leaves the log in place and the transaction
//! open; `rollback` (or crash recovery on the next open) restores the
//! snapshots and only then closes the transaction.

pub mod log;

use crate::error::DbError;
use crate::types::{ObjectInfo, Value};
use eyre::Result;

pub use log::{Frame, TxnLog};

#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    /// Insert (oid 0) or full rewrite of an object.
    Save(ObjectInfo),
    SetField { type_name: String, oid: i32, field: String, value: Value },
    Delete { type_name: String, oid: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct Transaction {
    ops: Vec<TxnOp>,
    state: TxnState,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self { ops: Vec::new(), state: TxnState::Open }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxnState::Open
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(DbError::TransactionClosed.into());
        }
        Ok(())
    }

    /// Queues an insert or full rewrite.
    pub fn save(&mut self, obj: ObjectInfo) -> Result<()> {
        self.ensure_open()?;
        self.ops.push(TxnOp::Save(obj));
        Ok(())
    }

    pub fn set_field(
        &mut self,
        type_name: impl Into<String>,
        oid: i32,
        field: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        self.ensure_open()?;
        self.ops.push(TxnOp::SetField {
            type_name: type_name.into(),
            oid,
            field: field.into(),
            value,
        });
        Ok(())
    }

    pub fn delete(&mut self, type_name: impl Into<String>, oid: i32) -> Result<()> {
        self.ensure_open()?;
        self.ops.push(TxnOp::Delete { type_name: type_name.into(), oid });
        Ok(())
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TxnState::Committed;
        self.ops.clear();
    }

    pub(crate) fn mark_rolled_back(&mut self) {
        self.state = TxnState::RolledBack;
        self.ops.clear();
    }
}
