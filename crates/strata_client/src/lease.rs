//! Client lease: a time-bounded identity issued by the cluster's lease
//! service, used by masters to fence stale clients.
//!
//! The commit engine fetches the lease once per transaction at `INIT` and
//! treats it as opaque; a commit is assumed to fit within one lease term.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// An issued lease. `lease_id` is globally unique; `lease_term_ms` is how
/// long the cluster will honor it from the moment of issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: u64,
    pub lease_term_ms: u64,
}

impl Lease {
    /// Placeholder value carried by a task before `INIT` runs.
    pub fn invalid() -> Self {
        Lease {
            lease_id: 0,
            lease_term_ms: 0,
        }
    }
}

/// The external lease service.
pub trait LeaseIssuer: Send + Sync {
    fn issue(&self) -> Lease;
}

struct CachedLease {
    lease: Lease,
    issued_at: Instant,
}

/// Process-wide lease cache.
///
/// Re-issues only once the cached lease has consumed the configured
/// fraction of its term, so back-to-back transactions share one lease
/// instead of hammering the lease service.
pub struct ClientLease {
    issuer: Arc<dyn LeaseIssuer>,
    refresh_fraction: f32,
    cached: Mutex<Option<CachedLease>>,
}

impl ClientLease {
    pub fn new(issuer: Arc<dyn LeaseIssuer>, refresh_fraction: f32) -> Self {
        ClientLease {
            issuer,
            refresh_fraction,
            cached: Mutex::new(None),
        }
    }

    pub fn get_lease(&self) -> Lease {
        let mut cached = self.cached.lock().unwrap();
        if let Some(current) = cached.as_ref() {
            let budget = Duration::from_millis(
                (current.lease.lease_term_ms as f64 * self.refresh_fraction as f64) as u64,
            );
            if current.issued_at.elapsed() < budget {
                return current.lease;
            }
        }
        let lease = self.issuer.issue();
        debug!(lease_id = lease.lease_id, term_ms = lease.lease_term_ms, "issued client lease");
        *cached = Some(CachedLease {
            lease,
            issued_at: Instant::now(),
        });
        lease
    }
}
