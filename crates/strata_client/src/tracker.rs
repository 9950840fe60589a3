//! RPC-id tracking: hands out contiguous participant-id blocks and keeps
//! the acknowledgment cursor that prepare requests piggy-back to masters.
//!
//! Masters use rpc ids to deduplicate retried prepares; the ack cursor
//! tells them which ids are finished so their dedup state can be garbage
//! collected. The tracker therefore never lets the cursor pass an
//! unfinished block.

use std::collections::BTreeMap;
use std::sync::{Mutex, Weak};

use tracing::debug;

/// A task the tracker may nudge toward completion when its id window
/// fills up.
pub trait TrackedRpc: Send + Sync {
    /// Make a slice of progress toward finishing, without blocking.
    fn try_finish(&self);
}

struct Block {
    len: u64,
    finished: bool,
    task: Weak<dyn TrackedRpc>,
}

struct TrackerInner {
    /// The next id that has never been issued.
    next_id: u64,
    /// Outstanding blocks keyed by their first id. The finished prefix is
    /// garbage collected, so the first entry is always unfinished.
    blocks: BTreeMap<u64, Block>,
}

/// Process-wide allocator of participant-id blocks.
pub struct RpcTracker {
    window: usize,
    inner: Mutex<TrackerInner>,
}

impl RpcTracker {
    pub fn new(window: usize) -> Self {
        RpcTracker {
            window,
            inner: Mutex::new(TrackerInner {
                next_id: 1,
                blocks: BTreeMap::new(),
            }),
        }
    }

    /// Reserve a contiguous block of `len` ids and return the first.
    ///
    /// If the window of outstanding blocks is full, the oldest unfinished
    /// task gets one `try_finish` nudge before allocation proceeds; the
    /// tracker never blocks waiting for room.
    pub fn new_rpc_id_block(&self, task: Weak<dyn TrackedRpc>, len: u64) -> u64 {
        debug_assert!(len > 0, "id blocks are never empty");
        let nudge = {
            let inner = self.inner.lock().unwrap();
            if inner.blocks.len() >= self.window {
                inner
                    .blocks
                    .values()
                    .find(|b| !b.finished)
                    .and_then(|b| b.task.upgrade())
            } else {
                None
            }
        };
        if let Some(oldest) = nudge {
            debug!("rpc id window full, nudging oldest unfinished task");
            oldest.try_finish();
        }

        let mut inner = self.inner.lock().unwrap();
        let first = inner.next_id;
        inner.next_id += len;
        inner.blocks.insert(
            first,
            Block {
                len,
                finished: false,
                task,
            },
        );
        first
    }

    /// Largest id at or below which every issued id has finished.
    pub fn ack_id(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.blocks.keys().next() {
            Some(first) => first - 1,
            None => inner.next_id - 1,
        }
    }

    /// Surrender the block that starts at `tx_id`.
    pub fn rpc_finished(&self, tx_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.blocks.get_mut(&tx_id) {
            Some(block) => block.finished = true,
            None => {
                debug!(tx_id, "ignoring finish for unknown id block");
                return;
            }
        }
        // Drop the finished prefix so the ack cursor can advance.
        while let Some((&first, block)) = inner.blocks.iter().next() {
            if !block.finished {
                break;
            }
            inner.blocks.remove(&first);
        }
    }

    /// Number of blocks not yet surrendered.
    pub fn outstanding_blocks(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .values()
            .filter(|b| !b.finished)
            .count()
    }
}
