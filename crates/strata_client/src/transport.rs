//! Transport seam consumed by the commit engine.
//!
//! Sessions are non-blocking: `send_request` hands the transport a list of
//! buffer segments and returns a completion handle immediately. Actual I/O
//! happens when the surrounding poll loop lets the transport run, so no
//! engine method ever blocks on the network.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// Shared handle to an open session with one master.
pub type SessionRef = Arc<dyn Session>;

/// One connection to a master, addressed by its service locator.
pub trait Session: Send + Sync {
    /// Stable address of the master this session talks to. Two sessions
    /// with equal locators reach the same master.
    fn service_locator(&self) -> &str;

    /// Queue a request for transmission. The segments are sent back to
    /// back; a transport may scatter-gather them without copying. Returns
    /// immediately with the completion slot for this RPC.
    fn send_request(&self, parts: Vec<Bytes>) -> RpcHandle;
}

/// Process-wide session factory and lifecycle manager.
pub trait TransportManager: Send + Sync {
    /// Open (or reuse) a session to the given locator.
    fn open_session(&self, locator: &str) -> SessionRef;

    /// Drop a broken session so the next open reconnects from scratch.
    fn flush_session(&self, locator: &str);

    /// Let queued I/O make progress. Called by the client poll loop
    /// between task slices.
    fn poll(&self);
}

/// Lifecycle of one in-flight RPC.
#[derive(Clone, Debug, Default)]
pub enum RpcState {
    #[default]
    InProgress,
    /// The server responded; the payload is the raw response frame.
    Finished(Bytes),
    /// Transport-level failure (connection loss, send error). The request
    /// may or may not have reached the server.
    Failed,
}

/// Completion slot shared between the engine and the transport.
///
/// The engine polls `state`; the transport side calls `complete` or `fail`
/// exactly once.
#[derive(Clone, Default)]
pub struct RpcHandle {
    slot: Arc<Mutex<RpcState>>,
}

impl RpcHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RpcState {
        self.slot.lock().unwrap().clone()
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.lock().unwrap(), RpcState::InProgress)
    }

    pub fn complete(&self, response: Bytes) {
        *self.slot.lock().unwrap() = RpcState::Finished(response);
    }

    pub fn fail(&self) {
        *self.slot.lock().unwrap() = RpcState::Failed;
    }
}
