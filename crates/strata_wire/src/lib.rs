//! Wire-format types for the Strata transaction protocol.
//!
//! This crate is kept small and dependency-light because it is shared by the
//! client commit engine, server-side tooling, and test harnesses. It defines
//! the status/vote/decision enums, the participant record layout, and the
//! framing of the two commit-protocol requests (prepare and decision) plus
//! their responses.
//!
//! All integers are little-endian. Encoders append to a `BytesMut`; decoders
//! consume from a `Bytes` and report truncated or malformed input through
//! [`WireError`] instead of panicking.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size in bytes of one encoded [`TxParticipant`].
pub const PARTICIPANT_WIRE_LEN: usize = 24;
/// Size in bytes of one encoded [`RejectRules`].
pub const REJECT_RULES_WIRE_LEN: usize = 12;

/// Errors produced while decoding protocol frames.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated: needed {needed} more bytes for {context}")]
    Truncated {
        context: &'static str,
        needed: usize,
    },
    #[error("unrecognized status code {0}")]
    UnknownStatus(u32),
    #[error("unrecognized rpc opcode {0}")]
    UnknownOpcode(u8),
    #[error("unrecognized decision byte {0}")]
    UnknownDecision(u8),
    #[error("unrecognized op kind byte {0}")]
    UnknownOpKind(u8),
    #[error("op key length {key_len} exceeds payload length {payload_len}")]
    BadObjectLayout { key_len: usize, payload_len: usize },
}

fn need(buf: &impl Buf, n: usize, context: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            context,
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// First byte of every request frame, identifying the RPC being invoked.
///
/// The low opcode space is reserved for the plain object RPCs of the read
/// client; the transaction protocol starts at 16.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcOpcode {
    TxPrepare,
    TxDecision,
}

impl RpcOpcode {
    pub fn code(self) -> u8 {
        match self {
            RpcOpcode::TxPrepare => 16,
            RpcOpcode::TxDecision => 17,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        Ok(match code {
            16 => RpcOpcode::TxPrepare,
            17 => RpcOpcode::TxDecision,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

/// Compute the routing hash for a user key.
///
/// The hash is part of the client/server addressing contract: masters own
/// tablets in key-hash space and the client groups participants by it.
pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Server status codes surfaced to the commit engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// The addressed master no longer owns the tablet; the client should
    /// refresh its routes and retry.
    UnknownTablet,
    TableDoesntExist,
    ObjectDoesntExist,
    WrongVersion,
    RetryLater,
    InternalError,
}

impl Status {
    pub fn code(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::UnknownTablet => 1,
            Status::TableDoesntExist => 2,
            Status::ObjectDoesntExist => 3,
            Status::WrongVersion => 4,
            Status::RetryLater => 5,
            Status::InternalError => 6,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, WireError> {
        Ok(match code {
            0 => Status::Ok,
            1 => Status::UnknownTablet,
            2 => Status::TableDoesntExist,
            3 => Status::ObjectDoesntExist,
            4 => Status::WrongVersion,
            5 => Status::RetryLater,
            6 => Status::InternalError,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }
}

/// A master's prepare-phase vote.
///
/// Anything other than the commit byte is treated as an abort vote, so a
/// newer server can introduce refined abort reasons without breaking older
/// clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Abort,
}

impl Vote {
    pub fn code(self) -> u8 {
        match self {
            Vote::Commit => 1,
            Vote::Abort => 2,
        }
    }

    pub fn from_code(code: u8) -> Self {
        if code == 1 {
            Vote::Commit
        } else {
            Vote::Abort
        }
    }
}

/// The globally consistent transaction outcome broadcast in phase two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxDecision {
    /// No decision reached yet; never valid on the wire in a decision
    /// request.
    Invalid,
    Commit,
    Abort,
}

impl TxDecision {
    pub fn code(self) -> u8 {
        match self {
            TxDecision::Invalid => 0,
            TxDecision::Commit => 1,
            TxDecision::Abort => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        Ok(match code {
            0 => TxDecision::Invalid,
            1 => TxDecision::Commit,
            2 => TxDecision::Abort,
            other => return Err(WireError::UnknownDecision(other)),
        })
    }
}

/// Kind of a staged operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Remove,
}

impl OpKind {
    pub fn code(self) -> u8 {
        match self {
            OpKind::Read => 1,
            OpKind::Write => 2,
            OpKind::Remove => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        Ok(match code {
            1 => OpKind::Read,
            2 => OpKind::Write,
            3 => OpKind::Remove,
            other => return Err(WireError::UnknownOpKind(other)),
        })
    }
}

/// Version preconditions attached to a prepare op.
///
/// An all-zero value means "no rules" and is what the fixed-width encoding
/// carries for ops staged without preconditions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RejectRules {
    pub given_version: u64,
    pub doesnt_exist: bool,
    pub exists: bool,
    pub version_le_given: bool,
    pub version_ne_given: bool,
}

impl RejectRules {
    /// Rules that reject unless the object still has exactly `version`.
    pub fn exact_version(version: u64) -> Self {
        RejectRules {
            given_version: version,
            doesnt_exist: true,
            version_ne_given: true,
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.given_version);
        buf.put_u8(self.doesnt_exist as u8);
        buf.put_u8(self.exists as u8);
        buf.put_u8(self.version_le_given as u8);
        buf.put_u8(self.version_ne_given as u8);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, REJECT_RULES_WIRE_LEN, "reject rules")?;
        Ok(RejectRules {
            given_version: buf.get_u64_le(),
            doesnt_exist: buf.get_u8() != 0,
            exists: buf.get_u8() != 0,
            version_le_given: buf.get_u8() != 0,
            version_ne_given: buf.get_u8() != 0,
        })
    }
}

/// One `(table_id, key_hash, rpc_id)` participant record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxParticipant {
    pub table_id: u64,
    pub key_hash: u64,
    pub rpc_id: u64,
}

impl TxParticipant {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.key_hash);
        buf.put_u64_le(self.rpc_id);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, PARTICIPANT_WIRE_LEN, "participant record")?;
        Ok(TxParticipant {
            table_id: buf.get_u64_le(),
            key_hash: buf.get_u64_le(),
            rpc_id: buf.get_u64_le(),
        })
    }
}

/// Fixed header of a prepare request.
///
/// The header is followed by `participant_count` participant records (the
/// full transaction roster, identical in every prepare RPC of one
/// transaction) and then `op_count` framed ops addressed to the receiving
/// master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrepareHeader {
    pub lease_id: u64,
    pub lease_term_ms: u64,
    /// Tracker acknowledgment cursor: every rpc id at or below this value
    /// has completed from the client's point of view.
    pub ack_id: u64,
    pub participant_count: u32,
    pub op_count: u32,
}

impl PrepareHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.lease_id);
        buf.put_u64_le(self.lease_term_ms);
        buf.put_u64_le(self.ack_id);
        buf.put_u32_le(self.participant_count);
        buf.put_u32_le(self.op_count);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 32, "prepare header")?;
        Ok(PrepareHeader {
            lease_id: buf.get_u64_le(),
            lease_term_ms: buf.get_u64_le(),
            ack_id: buf.get_u64_le(),
            participant_count: buf.get_u32_le(),
            op_count: buf.get_u32_le(),
        })
    }
}

/// One decoded prepare op.
///
/// `value` is present only for writes; read and remove ops carry just the
/// key. Produced by [`PrepareRequest::decode`] for server-side handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareOp {
    pub kind: OpKind,
    pub table_id: u64,
    pub rpc_id: u64,
    pub reject_rules: RejectRules,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Append the framing for a read or remove op. The caller appends the key
/// bytes separately so it can hand the transport a borrowed view.
pub fn encode_key_op_header(
    buf: &mut BytesMut,
    kind: OpKind,
    table_id: u64,
    rpc_id: u64,
    reject_rules: RejectRules,
    key_len: u16,
) {
    buf.put_u8(kind.code());
    buf.put_u64_le(table_id);
    buf.put_u64_le(rpc_id);
    reject_rules.encode(buf);
    buf.put_u16_le(key_len);
}

/// Append the framing for a write op. The payload that follows is the full
/// object buffer: `key_len:u16 ++ key ++ value`.
pub fn encode_write_op_header(
    buf: &mut BytesMut,
    table_id: u64,
    rpc_id: u64,
    reject_rules: RejectRules,
    buf_len: u32,
) {
    buf.put_u8(OpKind::Write.code());
    buf.put_u64_le(table_id);
    buf.put_u64_le(rpc_id);
    reject_rules.encode(buf);
    buf.put_u32_le(buf_len);
}

fn decode_op(buf: &mut Bytes) -> Result<PrepareOp, WireError> {
    need(buf, 1, "op kind")?;
    let kind = OpKind::from_code(buf.get_u8())?;
    need(buf, 16, "op header")?;
    let table_id = buf.get_u64_le();
    let rpc_id = buf.get_u64_le();
    let reject_rules = RejectRules::decode(buf)?;
    match kind {
        OpKind::Read | OpKind::Remove => {
            need(buf, 2, "op key length")?;
            let key_len = buf.get_u16_le() as usize;
            need(buf, key_len, "op key")?;
            let key = buf.split_to(key_len);
            Ok(PrepareOp {
                kind,
                table_id,
                rpc_id,
                reject_rules,
                key,
                value: None,
            })
        }
        OpKind::Write => {
            need(buf, 4, "object buffer length")?;
            let buf_len = buf.get_u32_le() as usize;
            need(buf, buf_len, "object buffer")?;
            let mut object = buf.split_to(buf_len);
            need(&object, 2, "object key length")?;
            let key_len = object.get_u16_le() as usize;
            if key_len > object.len() {
                return Err(WireError::BadObjectLayout {
                    key_len,
                    payload_len: object.len(),
                });
            }
            let key = object.split_to(key_len);
            Ok(PrepareOp {
                kind,
                table_id,
                rpc_id,
                reject_rules,
                key,
                value: Some(object),
            })
        }
    }
}

/// A fully decoded prepare request, used by server-side tooling and the
/// in-memory master in tests.
#[derive(Clone, Debug)]
pub struct PrepareRequest {
    pub header: PrepareHeader,
    pub participants: Vec<TxParticipant>,
    pub ops: Vec<PrepareOp>,
}

impl PrepareRequest {
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let header = PrepareHeader::decode(&mut buf)?;
        let mut participants = Vec::with_capacity(header.participant_count as usize);
        for _ in 0..header.participant_count {
            participants.push(TxParticipant::decode(&mut buf)?);
        }
        let mut ops = Vec::with_capacity(header.op_count as usize);
        for _ in 0..header.op_count {
            ops.push(decode_op(&mut buf)?);
        }
        Ok(PrepareRequest {
            header,
            participants,
            ops,
        })
    }
}

/// A decoded request frame, dispatched on the leading opcode byte. The
/// server-side entry point for the transaction protocol.
#[derive(Clone, Debug)]
pub enum Request {
    Prepare(PrepareRequest),
    Decision(DecisionRequest),
}

impl Request {
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        need(&buf, 1, "rpc opcode")?;
        match RpcOpcode::from_code(buf.get_u8())? {
            RpcOpcode::TxPrepare => Ok(Request::Prepare(PrepareRequest::decode(buf)?)),
            RpcOpcode::TxDecision => Ok(Request::Decision(DecisionRequest::decode(buf)?)),
        }
    }
}

/// Response to a prepare request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrepareResponse {
    pub status: Status,
    pub vote: Vote,
}

impl PrepareResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.status.code());
        buf.put_u8(self.vote.code());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        need(&buf, 5, "prepare response")?;
        let status = Status::from_code(buf.get_u32_le())?;
        let vote = Vote::from_code(buf.get_u8());
        Ok(PrepareResponse { status, vote })
    }
}

/// Fixed header of a decision request, followed by `participant_count`
/// participant records addressed to the receiving master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecisionHeader {
    pub decision: TxDecision,
    pub lease_id: u64,
    pub participant_count: u32,
}

impl DecisionHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.decision.code());
        buf.put_u64_le(self.lease_id);
        buf.put_u32_le(self.participant_count);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 13, "decision header")?;
        let decision = TxDecision::from_code(buf.get_u8())?;
        Ok(DecisionHeader {
            decision,
            lease_id: buf.get_u64_le(),
            participant_count: buf.get_u32_le(),
        })
    }
}

/// A fully decoded decision request.
#[derive(Clone, Debug)]
pub struct DecisionRequest {
    pub header: DecisionHeader,
    pub participants: Vec<TxParticipant>,
}

impl DecisionRequest {
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let header = DecisionHeader::decode(&mut buf)?;
        let mut participants = Vec::with_capacity(header.participant_count as usize);
        for _ in 0..header.participant_count {
            participants.push(TxParticipant::decode(&mut buf)?);
        }
        Ok(DecisionRequest {
            header,
            participants,
        })
    }
}

/// Response to a decision request. A bare acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecisionResponse {
    pub status: Status,
}

impl DecisionResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.status.code());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        need(&buf, 4, "decision response")?;
        let status = Status::from_code(buf.get_u32_le())?;
        Ok(DecisionResponse { status })
    }
}
