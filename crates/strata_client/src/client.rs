//! The client bundle: configuration plus the process-wide services every
//! transaction task shares.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lease::{ClientLease, LeaseIssuer};
use crate::manager::TransactionManager;
use crate::router::{CachingFinder, Directory, ObjectFinder};
use crate::task::{TaskHandle, TransactionTask};
use crate::tracker::RpcTracker;
use crate::transport::TransportManager;
use crate::txn::Transaction;

/// Operational tuning for the commit engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on participants per prepare or decision RPC.
    pub max_objects_per_rpc: u32,
    /// Outstanding id blocks the tracker tolerates before nudging the
    /// oldest unfinished task.
    pub tracker_window: usize,
    /// Fraction of a lease term after which the cached lease is re-issued.
    pub lease_refresh_fraction: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_objects_per_rpc: 75,
            tracker_window: 512,
            lease_refresh_fraction: 0.5,
        }
    }
}

impl Config {
    /// Defaults with `STRATA_*` environment overrides, matching how the
    /// rest of the fleet tunes itself.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            max_objects_per_rpc: env_parse(
                "STRATA_MAX_OBJECTS_PER_RPC",
                defaults.max_objects_per_rpc,
            ),
            tracker_window: env_parse("STRATA_TRACKER_WINDOW", defaults.tracker_window),
            lease_refresh_fraction: env_parse(
                "STRATA_LEASE_REFRESH_FRACTION",
                defaults.lease_refresh_fraction,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(name, value = %raw, "ignoring unparsable environment override");
            default
        }),
        Err(_) => default,
    }
}

/// Process-wide collaborators shared by every task. Thread-safe by
/// contract; tasks hold no locks on them.
pub(crate) struct ClientContext {
    pub(crate) config: Config,
    pub(crate) finder: Arc<dyn ObjectFinder>,
    pub(crate) transport: Arc<dyn TransportManager>,
    pub(crate) lease: ClientLease,
    pub(crate) tracker: RpcTracker,
}

pub(crate) struct ClientShared {
    pub(crate) ctx: Arc<ClientContext>,
    pub(crate) manager: TransactionManager,
}

impl ClientShared {
    /// One sweep of the poll loop: give every active task a slice, then
    /// let the transport run so responses are ready for the next sweep.
    pub(crate) fn poll(&self) {
        self.manager.poll();
        self.ctx.transport.poll();
    }
}

/// Entry point for applications: holds the shared services and hands out
/// transactions.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Build a client around an already-constructed finder.
    pub fn new(
        finder: Arc<dyn ObjectFinder>,
        transport: Arc<dyn TransportManager>,
        lease_issuer: Arc<dyn LeaseIssuer>,
        config: Config,
    ) -> Self {
        let lease = ClientLease::new(lease_issuer, config.lease_refresh_fraction);
        let tracker = RpcTracker::new(config.tracker_window);
        let ctx = Arc::new(ClientContext {
            config,
            finder,
            transport,
            lease,
            tracker,
        });
        Client {
            shared: Arc::new(ClientShared {
                ctx,
                manager: TransactionManager::new(),
            }),
        }
    }

    /// Build a client with the production route cache over `directory`.
    pub fn with_directory(
        directory: Arc<dyn Directory>,
        transport: Arc<dyn TransportManager>,
        lease_issuer: Arc<dyn LeaseIssuer>,
        config: Config,
    ) -> Self {
        let finder = Arc::new(CachingFinder::new(directory, transport.clone()));
        Client::new(finder, transport, lease_issuer, config)
    }

    /// Start a new, empty transaction.
    pub fn begin(&self) -> Transaction {
        let task = TaskHandle::new(TransactionTask::new(self.shared.ctx.clone()));
        Transaction::new(self.shared.clone(), task)
    }

    /// One slice of client-wide progress: poll active tasks, then the
    /// transport.
    pub fn poll(&self) {
        self.shared.poll();
    }

    /// Number of transactions currently committing.
    pub fn active_transactions(&self) -> usize {
        self.shared.manager.active_tasks()
    }

    /// The shared rpc-id tracker. Exposed for observability; applications
    /// normally never touch it.
    pub fn rpc_tracker(&self) -> &RpcTracker {
        &self.shared.ctx.tracker
    }
}
