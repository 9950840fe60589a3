//! The staging façade: what applications hold while building and
//! committing one transaction.
//!
//! Staging dedupes by user key: writing the same key twice updates the
//! staged entry in place, so a transaction never carries two live
//! participants for one key. (The commit cache underneath stays
//! duplicate-tolerant for callers that stage through the task directly.)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use strata_wire::{OpKind, RejectRules, Status, TxDecision};

use crate::client::ClientShared;
use crate::error::{Result, TxError};
use crate::task::{TaskHandle, TaskState};

/// One client transaction.
pub struct Transaction {
    shared: Arc<ClientShared>,
    task: TaskHandle,
    started: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<ClientShared>, task: TaskHandle) -> Self {
        Transaction {
            shared,
            task,
            started: AtomicBool::new(false),
        }
    }

    /// Stage a write of `value` under `(table_id, key)`.
    ///
    /// An earlier staged operation on the same key is upgraded in place;
    /// its version preconditions, if any, are kept.
    pub fn write(&self, table_id: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.stage(table_id, key, OpKind::Write, value)
    }

    /// Stage a removal of `(table_id, key)`.
    pub fn remove(&self, table_id: u64, key: &[u8]) -> Result<()> {
        self.stage(table_id, key, OpKind::Remove, &[])
    }

    fn stage(&self, table_id: u64, key: &[u8], op: OpKind, value: &[u8]) -> Result<()> {
        self.task.with(|task| {
            if task.state() != TaskState::Init {
                return Err(TxError::CommitStarted);
            }
            if let Some(entry) = task.find_cache_entry_mut(table_id, key) {
                entry.object = crate::cache::ObjectBuf::new(key, value)?;
                entry.op = op;
                return Ok(());
            }
            task.insert_cache_entry(table_id, key, op, value)?;
            Ok(())
        })
    }

    /// The value this transaction would leave under `(table_id, key)`:
    /// the staged write's value, or `None` for keys this transaction
    /// removes or does not touch. Reading current server state is the read
    /// client's job, not the commit engine's.
    pub fn read(&self, table_id: u64, key: &[u8]) -> Option<Bytes> {
        self.task.with(|task| {
            task.find_cache_entry(table_id, key).and_then(|entry| {
                if entry.op == OpKind::Write {
                    Some(entry.object.value_bytes())
                } else {
                    None
                }
            })
        })
    }

    /// Fence a value the application read outside this transaction: the
    /// commit aborts unless `(table_id, key)` still has exactly `version`
    /// at prepare time.
    pub fn validate_read(&self, table_id: u64, key: &[u8], version: u64) -> Result<()> {
        self.task.with(|task| {
            if task.state() != TaskState::Init {
                return Err(TxError::CommitStarted);
            }
            if let Some(entry) = task.find_cache_entry_mut(table_id, key) {
                entry.reject_rules = Some(RejectRules::exact_version(version));
                return Ok(());
            }
            let entry = task.insert_cache_entry(table_id, key, OpKind::Read, &[])?;
            entry.reject_rules = Some(RejectRules::exact_version(version));
            Ok(())
        })
    }

    /// Hand the task to the manager; the next client poll starts the
    /// commit protocol. Idempotent.
    pub fn start_commit(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.shared.manager.add_task(self.task.clone());
        }
    }

    /// Commit and block (by polling) until the global decision is known.
    ///
    /// Recoverable faults are retried without bound, so this returns only
    /// once the cluster yields a decision or a fatal status. Callers that
    /// need an upper bound drive the poll loop themselves via
    /// [`Transaction::start_commit`] and [`Transaction::is_done`].
    pub fn commit(&self) -> Result<TxDecision> {
        self.start_commit();
        while !self.task.is_done() {
            self.shared.poll();
        }
        match self.task.status() {
            Status::Ok => Ok(self.task.decision()),
            status => Err(TxError::Server(status)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    /// Terminal protocol status; `Status::Ok` until a fatal fault occurs.
    pub fn status(&self) -> Status {
        self.task.status()
    }

    /// The global outcome; `Invalid` until the decision phase is entered.
    pub fn decision(&self) -> TxDecision {
        self.task.decision()
    }

    /// The underlying task handle, for applications (and tests) that embed
    /// their own poll loop.
    pub fn task(&self) -> TaskHandle {
        self.task.clone()
    }
}
