//! Client-side transaction commit engine for the Strata distributed
//! in-memory key-value store.
//!
//! Applications stage reads, writes, and removes on a [`Transaction`] and
//! commit them atomically; the engine assigns participant identities,
//! drives pipelined two-phase commit against the masters owning each key,
//! and reports the global decision. Everything runs on the caller's poll
//! thread: no method blocks on the network, and forward progress comes
//! from repeatedly calling [`Client::poll`].
//!
//! The cluster-facing seams (tablet directory, transport, lease service)
//! are traits so the engine can run against any deployment, or an
//! in-memory cluster in tests.

pub mod cache;
pub mod client;
pub mod error;
pub mod lease;
pub mod manager;
pub mod router;
pub mod task;
pub mod tracker;
pub mod transport;
pub mod txn;

pub use client::{Client, Config};
pub use error::{Result, TxError};
pub use lease::{Lease, LeaseIssuer};
pub use router::{Directory, ObjectFinder, TabletRoute};
pub use task::{TaskHandle, TaskState};
pub use transport::{RpcHandle, RpcState, Session, SessionRef, TransportManager};
pub use txn::Transaction;

pub use strata_wire as wire;
