//! The transaction commit task: a poll-driven state machine that takes one
//! transaction's staged operations through two-phase commit.
//!
//! `perform_task` never blocks; it does one incremental slice of work per
//! call (drain completed RPCs, then launch at most one new RPC) and relies
//! on the surrounding poll loop to let the transport run between slices.
//! Recoverable faults (transport failures, stale routes) rewind the
//! affected participants and retry without bound; any other server status
//! stops the protocol and is reported through `status`.

use std::sync::{Arc, Mutex, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use strata_wire::{self as wire, OpKind, RpcOpcode, Status, TxDecision, TxParticipant, Vote};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, CommitCache, EntryState};
use crate::client::ClientContext;
use crate::error::{Result, TxError};
use crate::lease::Lease;
use crate::tracker::TrackedRpc;
use crate::transport::{RpcHandle, RpcState, SessionRef};

/// Commit-protocol phase of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Prepare,
    Decision,
    Done,
}

/// One client transaction's commit engine.
pub struct TransactionTask {
    context: Arc<ClientContext>,
    handle: Weak<Mutex<TransactionTask>>,
    state: TaskState,
    status: Status,
    decision: TxDecision,
    lease: Lease,
    /// First id of this task's participant-id block; entry `i` in cache
    /// order gets `tx_id + i`.
    tx_id: u64,
    participant_count: u32,
    /// The full roster in wire form, built once at `INIT` and shared into
    /// every prepare request as a refcounted view.
    participant_list: Bytes,
    commit_cache: CommitCache,
    /// Flat cursor into the frozen cache: the next entry a send step will
    /// consider. Reset at phase boundaries and on every retry.
    next_cache_entry: usize,
    prepare_rpcs: Vec<PrepareRpc>,
    decision_rpcs: Vec<DecisionRpc>,
}

impl TransactionTask {
    pub(crate) fn new(context: Arc<ClientContext>) -> Self {
        TransactionTask {
            context,
            handle: Weak::new(),
            state: TaskState::Init,
            status: Status::Ok,
            decision: TxDecision::Invalid,
            lease: Lease::invalid(),
            tx_id: 0,
            participant_count: 0,
            participant_list: Bytes::new(),
            commit_cache: CommitCache::new(),
            next_cache_entry: 0,
            prepare_rpcs: Vec::new(),
            decision_rpcs: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Terminal protocol status; meaningful once the task is `Done`.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The global outcome; `Invalid` until the decision phase is entered.
    pub fn decision(&self) -> TxDecision {
        self.decision
    }

    /// Locate the staged entry for `key`, tolerating hash collisions. The
    /// reference is invalidated by any later cache mutation.
    pub fn find_cache_entry(&self, table_id: u64, key: &[u8]) -> Option<&CacheEntry> {
        self.commit_cache.find(table_id, key)
    }

    pub fn find_cache_entry_mut(&mut self, table_id: u64, key: &[u8]) -> Option<&mut CacheEntry> {
        self.commit_cache.find_mut(table_id, key)
    }

    /// Stage a new operation. Fails once the task has left `Init`: the
    /// cache is frozen for the rest of the commit protocol.
    pub fn insert_cache_entry(
        &mut self,
        table_id: u64,
        key: &[u8],
        op: OpKind,
        value: &[u8],
    ) -> Result<&mut CacheEntry> {
        if self.state != TaskState::Init {
            return Err(TxError::CommitStarted);
        }
        self.commit_cache.insert(table_id, key, op, value)
    }

    /// Make incremental progress toward committing. One slice per call;
    /// idempotent once `Done`.
    pub fn perform_task(&mut self) {
        if let Err(err) = self.advance() {
            let status = err.status();
            warn!(tx_id = self.tx_id, ?status, "commit protocol stopped");
            // Outstanding RPCs are abandoned; their server-side completion
            // is harmless because the decision phase never runs.
            self.prepare_rpcs.clear();
            self.decision_rpcs.clear();
            self.status = status;
            self.context.tracker.rpc_finished(self.tx_id);
            self.state = TaskState::Done;
        }
    }

    fn advance(&mut self) -> Result<()> {
        if self.state == TaskState::Init {
            self.init_task();
            self.next_cache_entry = 0;
            self.state = TaskState::Prepare;
            debug!(
                tx_id = self.tx_id,
                participants = self.participant_count,
                "entering prepare phase"
            );
        }
        if self.state == TaskState::Prepare {
            self.process_prepare_rpcs()?;
            self.send_prepare_rpc()?;
            if self.prepare_rpcs.is_empty() && self.next_cache_entry >= self.commit_cache.len() {
                self.next_cache_entry = 0;
                if self.decision != TxDecision::Abort {
                    self.decision = TxDecision::Commit;
                }
                self.state = TaskState::Decision;
                debug!(tx_id = self.tx_id, decision = ?self.decision, "entering decision phase");
            }
        }
        if self.state == TaskState::Decision {
            self.process_decision_rpcs()?;
            self.send_decision_rpc()?;
            if self.decision_rpcs.is_empty() && self.next_cache_entry >= self.commit_cache.len() {
                self.context.tracker.rpc_finished(self.tx_id);
                self.state = TaskState::Done;
                debug!(tx_id = self.tx_id, decision = ?self.decision, "transaction done");
            }
        }
        Ok(())
    }

    /// Acquire the lease, reserve the participant-id block, and build the
    /// roster every prepare request carries.
    fn init_task(&mut self) {
        self.lease = self.context.lease.get_lease();
        // The empty transaction still needs an identity to surrender.
        let block_len = (self.commit_cache.len() as u64).max(1);
        let tracked: Weak<dyn TrackedRpc> = self.handle.clone();
        self.tx_id = self.context.tracker.new_rpc_id_block(tracked, block_len);

        let mut list =
            BytesMut::with_capacity(self.commit_cache.len() * wire::PARTICIPANT_WIRE_LEN);
        let tx_id = self.tx_id;
        for (i, (key, entry)) in self.commit_cache.iter_mut().enumerate() {
            entry.rpc_id = tx_id + i as u64;
            TxParticipant {
                table_id: key.table_id,
                key_hash: key.key_hash,
                rpc_id: entry.rpc_id,
            }
            .encode(&mut list);
        }
        self.participant_count = self.commit_cache.len() as u32;
        self.participant_list = list.freeze();
    }

    /// Drain completed prepare RPCs, aggregating votes and classifying
    /// faults.
    fn process_prepare_rpcs(&mut self) -> Result<()> {
        let mut still_pending = Vec::new();
        for rpc in std::mem::take(&mut self.prepare_rpcs) {
            match rpc.state() {
                RpcState::InProgress => still_pending.push(rpc),
                RpcState::Failed => {
                    warn!(
                        tx_id = self.tx_id,
                        locator = %rpc.locator,
                        "transport failure on prepare, retrying participants"
                    );
                    self.context.transport.flush_session(&rpc.locator);
                    self.retry_request(&rpc.ops);
                }
                RpcState::Finished(response) => {
                    let response = wire::PrepareResponse::decode(response)?;
                    match response.status {
                        Status::Ok => {
                            if response.vote != Vote::Commit {
                                self.decision = TxDecision::Abort;
                            }
                        }
                        Status::UnknownTablet => {
                            // The master disclaimed ownership; refresh the
                            // routes and retry. The session itself is fine.
                            debug!(
                                tx_id = self.tx_id,
                                locator = %rpc.locator,
                                "stale route on prepare, retrying participants"
                            );
                            self.retry_request(&rpc.ops);
                        }
                        status => return Err(TxError::Server(status)),
                    }
                }
            }
        }
        self.prepare_rpcs = still_pending;
        Ok(())
    }

    /// Launch at most one prepare RPC covering a run of unclaimed entries
    /// that share an owning master.
    fn send_prepare_rpc(&mut self) -> Result<()> {
        let mut next_rpc: Option<PrepareRpc> = None;
        while let Some((key, state)) = self
            .commit_cache
            .entry_at(self.next_cache_entry)
            .map(|(key, entry)| (key, entry.state))
        {
            if state == EntryState::Prepare {
                // Already attached to an in-flight RPC.
                self.next_cache_entry += 1;
                continue;
            }
            let session = self.context.finder.lookup(key.table_id, key.key_hash)?;
            let open_new = match next_rpc.as_ref() {
                None => true,
                Some(rpc)
                    if session.service_locator() == rpc.locator
                        && (rpc.ops.len() as u32) < self.context.config.max_objects_per_rpc =>
                {
                    false
                }
                // Different master or saturated request: the cursor stays
                // on the unclaimed entry for the next send step.
                Some(_) => break,
            };
            if open_new {
                next_rpc = Some(PrepareRpc::new(
                    session,
                    self.lease,
                    self.participant_count,
                    self.participant_list.clone(),
                ));
            }
            let (key, entry) = self
                .commit_cache
                .entry_at_mut(self.next_cache_entry)
                .expect("cursor is in bounds");
            next_rpc
                .as_mut()
                .expect("rpc under construction")
                .append_op(self.next_cache_entry, key, entry);
            self.next_cache_entry += 1;
        }
        if let Some(mut rpc) = next_rpc {
            rpc.send(&self.context);
            self.prepare_rpcs.push(rpc);
        }
        Ok(())
    }

    /// Drain completed decision RPCs.
    fn process_decision_rpcs(&mut self) -> Result<()> {
        let mut still_pending = Vec::new();
        for rpc in std::mem::take(&mut self.decision_rpcs) {
            match rpc.state() {
                RpcState::InProgress => still_pending.push(rpc),
                RpcState::Failed => {
                    warn!(
                        tx_id = self.tx_id,
                        locator = %rpc.locator,
                        "transport failure on decision, retrying participants"
                    );
                    self.context.transport.flush_session(&rpc.locator);
                    self.retry_request(&rpc.ops);
                }
                RpcState::Finished(response) => {
                    let response = wire::DecisionResponse::decode(response)?;
                    match response.status {
                        Status::Ok => {}
                        Status::UnknownTablet => {
                            debug!(
                                tx_id = self.tx_id,
                                locator = %rpc.locator,
                                "stale route on decision, retrying participants"
                            );
                            self.retry_request(&rpc.ops);
                        }
                        status => return Err(TxError::Server(status)),
                    }
                }
            }
        }
        self.decision_rpcs = still_pending;
        Ok(())
    }

    /// Launch at most one decision RPC, mirroring the prepare send step.
    fn send_decision_rpc(&mut self) -> Result<()> {
        let mut next_rpc: Option<DecisionRpc> = None;
        while let Some((key, state)) = self
            .commit_cache
            .entry_at(self.next_cache_entry)
            .map(|(key, entry)| (key, entry.state))
        {
            if state == EntryState::Decide {
                self.next_cache_entry += 1;
                continue;
            }
            let session = self.context.finder.lookup(key.table_id, key.key_hash)?;
            let open_new = match next_rpc.as_ref() {
                None => true,
                Some(rpc)
                    if session.service_locator() == rpc.locator
                        && (rpc.ops.len() as u32) < self.context.config.max_objects_per_rpc =>
                {
                    false
                }
                Some(_) => break,
            };
            if open_new {
                next_rpc = Some(DecisionRpc::new(
                    session,
                    self.decision,
                    self.lease.lease_id,
                ));
            }
            let (key, entry) = self
                .commit_cache
                .entry_at_mut(self.next_cache_entry)
                .expect("cursor is in bounds");
            next_rpc
                .as_mut()
                .expect("rpc under construction")
                .append_op(self.next_cache_entry, key, entry);
            self.next_cache_entry += 1;
        }
        if let Some(mut rpc) = next_rpc {
            rpc.send();
            self.decision_rpcs.push(rpc);
        }
        Ok(())
    }

    /// Arrange for the given participants to be tried again: flush their
    /// table routes, reset them to `Pending`, rewind the cursor. Exactly
    /// the failed RPC's own entries are touched.
    fn retry_request(&mut self, ops: &[usize]) {
        for &pos in ops {
            let (key, entry) = self
                .commit_cache
                .entry_at_mut(pos)
                .expect("op position is in the frozen cache");
            self.context.finder.flush(key.table_id);
            entry.state = EntryState::Pending;
        }
        self.next_cache_entry = 0;
    }
}

impl TrackedRpc for Mutex<TransactionTask> {
    /// One nudge of forward progress: a task slice plus a transport poll.
    /// Skips silently if the task is already being driven on this thread.
    fn try_finish(&self) {
        let transport = match self.try_lock() {
            Ok(mut task) => {
                task.perform_task();
                task.context.transport.clone()
            }
            Err(_) => return,
        };
        transport.poll();
    }
}

/// Cloneable, shared handle to a task; what the manager polls and the
/// staging façade talks through.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Mutex<TransactionTask>>,
}

impl TaskHandle {
    pub(crate) fn new(task: TransactionTask) -> Self {
        let inner = Arc::new(Mutex::new(task));
        inner.lock().unwrap().handle = Arc::downgrade(&inner);
        TaskHandle { inner }
    }

    pub fn perform_task(&self) {
        self.inner.lock().unwrap().perform_task();
    }

    /// Nudge the task toward completion: one slice plus a transport poll.
    pub fn try_finish(&self) {
        TrackedRpc::try_finish(&*self.inner);
    }

    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state()
    }

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status()
    }

    pub fn decision(&self) -> TxDecision {
        self.inner.lock().unwrap().decision()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut TransactionTask) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }
}

/// One in-flight prepare request.
struct PrepareRpc {
    session: SessionRef,
    locator: String,
    lease: Lease,
    participant_count: u32,
    participant_list: Bytes,
    /// Flat cache positions of the appended ops, in append order; the
    /// reverse mapping used to rewind state on retry.
    ops: Vec<usize>,
    op_parts: Vec<Bytes>,
    handle: Option<RpcHandle>,
}

impl PrepareRpc {
    fn new(
        session: SessionRef,
        lease: Lease,
        participant_count: u32,
        participant_list: Bytes,
    ) -> Self {
        let locator = session.service_locator().to_string();
        PrepareRpc {
            session,
            locator,
            lease,
            participant_count,
            participant_list,
            ops: Vec::new(),
            op_parts: Vec::new(),
            handle: None,
        }
    }

    fn state(&self) -> RpcState {
        match &self.handle {
            Some(handle) => handle.state(),
            None => RpcState::InProgress,
        }
    }

    /// Append one staged op and advance its entry to `Prepare`.
    fn append_op(&mut self, pos: usize, key: CacheKey, entry: &mut CacheEntry) {
        let reject_rules = entry.reject_rules.unwrap_or_default();
        let mut header = BytesMut::new();
        match entry.op {
            OpKind::Read | OpKind::Remove => {
                wire::encode_key_op_header(
                    &mut header,
                    entry.op,
                    key.table_id,
                    entry.rpc_id,
                    reject_rules,
                    entry.object.key_len(),
                );
                self.op_parts.push(header.freeze());
                self.op_parts.push(entry.object.key_bytes());
            }
            OpKind::Write => {
                wire::encode_write_op_header(
                    &mut header,
                    key.table_id,
                    entry.rpc_id,
                    reject_rules,
                    entry.object.wire_len(),
                );
                self.op_parts.push(header.freeze());
                self.op_parts.push(entry.object.wire_bytes());
            }
        }
        entry.state = EntryState::Prepare;
        self.ops.push(pos);
    }

    fn send(&mut self, context: &ClientContext) {
        let mut header = BytesMut::new();
        header.put_u8(RpcOpcode::TxPrepare.code());
        wire::PrepareHeader {
            lease_id: self.lease.lease_id,
            lease_term_ms: self.lease.lease_term_ms,
            // Fetched at send time so every prepare carries the freshest
            // acknowledgment cursor.
            ack_id: context.tracker.ack_id(),
            participant_count: self.participant_count,
            op_count: self.ops.len() as u32,
        }
        .encode(&mut header);

        let mut parts = Vec::with_capacity(2 + self.op_parts.len());
        parts.push(header.freeze());
        parts.push(self.participant_list.clone());
        parts.append(&mut self.op_parts);
        self.handle = Some(self.session.send_request(parts));
    }
}

/// One in-flight decision request.
struct DecisionRpc {
    session: SessionRef,
    locator: String,
    decision: TxDecision,
    lease_id: u64,
    ops: Vec<usize>,
    participants: BytesMut,
    handle: Option<RpcHandle>,
}

impl DecisionRpc {
    fn new(session: SessionRef, decision: TxDecision, lease_id: u64) -> Self {
        let locator = session.service_locator().to_string();
        DecisionRpc {
            session,
            locator,
            decision,
            lease_id,
            ops: Vec::new(),
            participants: BytesMut::new(),
            handle: None,
        }
    }

    fn state(&self) -> RpcState {
        match &self.handle {
            Some(handle) => handle.state(),
            None => RpcState::InProgress,
        }
    }

    /// Append one participant and advance its entry to `Decide`.
    fn append_op(&mut self, pos: usize, key: CacheKey, entry: &mut CacheEntry) {
        TxParticipant {
            table_id: key.table_id,
            key_hash: key.key_hash,
            rpc_id: entry.rpc_id,
        }
        .encode(&mut self.participants);
        entry.state = EntryState::Decide;
        self.ops.push(pos);
    }

    fn send(&mut self) {
        let mut header = BytesMut::new();
        header.put_u8(RpcOpcode::TxDecision.code());
        wire::DecisionHeader {
            decision: self.decision,
            lease_id: self.lease_id,
            participant_count: self.ops.len() as u32,
        }
        .encode(&mut header);

        let parts = vec![header.freeze(), std::mem::take(&mut self.participants).freeze()];
        self.handle = Some(self.session.send_request(parts));
    }
}
