//! Client-side object location: the oracle that maps `(table_id, key_hash)`
//! to the session of the master currently owning that tablet.
//!
//! Routes are resolved through a [`Directory`] and cached per table. The
//! cache may go stale at any time (tablets move between masters); the
//! commit engine reacts to `UNKNOWN_TABLET` and transport faults by calling
//! [`ObjectFinder::flush`], which forces the next lookup back to the
//! directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::transport::{SessionRef, TransportManager};

/// The object-location oracle consumed by the commit engine.
pub trait ObjectFinder: Send + Sync {
    /// Session of the master believed to own `(table_id, key_hash)`. The
    /// answer may be stale; callers must tolerate `UNKNOWN_TABLET`.
    fn lookup(&self, table_id: u64, key_hash: u64) -> Result<SessionRef>;

    /// Invalidate every cached route for `table_id`.
    fn flush(&self, table_id: u64);
}

/// One tablet's ownership record. Hash bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletRoute {
    pub start_hash: u64,
    pub end_hash: u64,
    pub locator: String,
}

impl TabletRoute {
    pub fn contains(&self, key_hash: u64) -> bool {
        self.start_hash <= key_hash && key_hash <= self.end_hash
    }
}

/// Authoritative tablet directory, typically backed by the cluster
/// coordinator. Only consulted on cache misses.
pub trait Directory: Send + Sync {
    /// Resolve the tablet currently covering `(table_id, key_hash)`. Fails
    /// with `Status::TableDoesntExist` for unknown tables, which is fatal
    /// to the transaction.
    fn locate(&self, table_id: u64, key_hash: u64) -> Result<TabletRoute>;
}

/// The client's production finder: a per-table route cache over a
/// [`Directory`], opening sessions through the transport manager.
pub struct CachingFinder {
    directory: Arc<dyn Directory>,
    transport: Arc<dyn TransportManager>,
    routes: Mutex<HashMap<u64, Vec<TabletRoute>>>,
}

impl CachingFinder {
    pub fn new(directory: Arc<dyn Directory>, transport: Arc<dyn TransportManager>) -> Self {
        CachingFinder {
            directory,
            transport,
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl ObjectFinder for CachingFinder {
    fn lookup(&self, table_id: u64, key_hash: u64) -> Result<SessionRef> {
        let mut routes = self.routes.lock().unwrap();
        let table = routes.entry(table_id).or_default();
        if let Some(route) = table.iter().find(|r| r.contains(key_hash)) {
            return Ok(self.transport.open_session(&route.locator));
        }
        let route = self.directory.locate(table_id, key_hash)?;
        debug!(table_id, key_hash, locator = %route.locator, "refreshed tablet route");
        let session = self.transport.open_session(&route.locator);
        table.push(route);
        Ok(session)
    }

    fn flush(&self, table_id: u64) {
        if self.routes.lock().unwrap().remove(&table_id).is_some() {
            debug!(table_id, "flushed cached routes");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::transport::{RpcHandle, Session};

    struct NullSession(String);

    impl Session for NullSession {
        fn service_locator(&self) -> &str {
            &self.0
        }

        fn send_request(&self, _parts: Vec<Bytes>) -> RpcHandle {
            RpcHandle::new()
        }
    }

    #[derive(Default)]
    struct NullTransport;

    impl TransportManager for NullTransport {
        fn open_session(&self, locator: &str) -> SessionRef {
            Arc::new(NullSession(locator.to_string()))
        }

        fn flush_session(&self, _locator: &str) {}

        fn poll(&self) {}
    }

    struct OneTablet {
        locator: Mutex<String>,
        locate_calls: AtomicUsize,
    }

    impl Directory for OneTablet {
        fn locate(&self, _table_id: u64, _key_hash: u64) -> Result<TabletRoute> {
            self.locate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TabletRoute {
                start_hash: 0,
                end_hash: u64::MAX,
                locator: self.locator.lock().unwrap().clone(),
            })
        }
    }

    #[test]
    fn lookups_hit_the_cache_until_flushed() {
        let directory = Arc::new(OneTablet {
            locator: Mutex::new("master-a".to_string()),
            locate_calls: AtomicUsize::new(0),
        });
        let finder = CachingFinder::new(directory.clone(), Arc::new(NullTransport));

        let first = finder.lookup(1, 10).unwrap();
        let second = finder.lookup(1, 20).unwrap();
        assert_eq!(first.service_locator(), "master-a");
        assert_eq!(second.service_locator(), "master-a");
        assert_eq!(directory.locate_calls.load(Ordering::SeqCst), 1);

        // Ownership moves; only a flush makes the client notice.
        *directory.locator.lock().unwrap() = "master-b".to_string();
        assert_eq!(finder.lookup(1, 10).unwrap().service_locator(), "master-a");
        finder.flush(1);
        assert_eq!(finder.lookup(1, 10).unwrap().service_locator(), "master-b");
        assert_eq!(directory.locate_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_is_scoped_to_one_table() {
        let directory = Arc::new(OneTablet {
            locator: Mutex::new("master-a".to_string()),
            locate_calls: AtomicUsize::new(0),
        });
        let finder = CachingFinder::new(directory.clone(), Arc::new(NullTransport));
        finder.lookup(1, 0).unwrap();
        finder.lookup(2, 0).unwrap();
        finder.flush(1);
        finder.lookup(2, 0).unwrap();
        // Table 2's route survived the flush of table 1.
        assert_eq!(directory.locate_calls.load(Ordering::SeqCst), 2);
    }
}
