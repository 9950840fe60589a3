//! Client-side error types.

use strata_wire::{Status, WireError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TxError>;

/// Errors surfaced by the transaction client.
///
/// Recoverable conditions (transport faults, stale routes) never appear
/// here; the commit engine retries those internally. What does appear is
/// either a staging misuse or a server status that aborts the protocol.
#[derive(Error, Debug)]
pub enum TxError {
    #[error("server returned status {0:?}")]
    Server(Status),
    #[error("operation staged after commit started")]
    CommitStarted,
    #[error("key length {0} exceeds the wire limit")]
    KeyTooLong(usize),
    #[error("malformed response: {0}")]
    Wire(#[from] WireError),
}

impl TxError {
    /// The status recorded on the task when this error stops the commit
    /// protocol.
    pub fn status(&self) -> Status {
        match self {
            TxError::Server(status) => *status,
            TxError::CommitStarted | TxError::KeyTooLong(_) | TxError::Wire(_) => {
                Status::InternalError
            }
        }
    }
}
