//! Shared helpers for integration tests: an in-memory cluster of
//! scriptable masters behind a loopback transport.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use strata_client::wire::{
    DecisionRequest, DecisionResponse, PrepareRequest, PrepareResponse, Request, Status, Vote,
};
use strata_client::{
    Client, Config, Directory, Lease, LeaseIssuer, Result, RpcHandle, Session, SessionRef,
    TabletRoute, TransportManager, TxError,
};

/// Scripted behavior for the next request a master receives. With an empty
/// script a master votes commit on prepare and acknowledges decisions.
pub enum MasterReply {
    /// Fail at the transport before the master sees the request.
    TransportFail,
    Prepare { status: Status, vote: Vote },
    Decision { status: Status },
}

/// One in-memory master. Decodes every request it receives and keeps the
/// decoded forms for assertions.
pub struct MasterNode {
    pub locator: String,
    script: Mutex<VecDeque<MasterReply>>,
    pub prepare_log: Mutex<Vec<PrepareRequest>>,
    pub decision_log: Mutex<Vec<DecisionRequest>>,
}

impl MasterNode {
    fn new(locator: &str) -> Self {
        MasterNode {
            locator: locator.to_string(),
            script: Mutex::new(VecDeque::new()),
            prepare_log: Mutex::new(Vec::new()),
            decision_log: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue(&self, reply: MasterReply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn prepares(&self) -> Vec<PrepareRequest> {
        self.prepare_log.lock().unwrap().clone()
    }

    pub fn decisions(&self) -> Vec<DecisionRequest> {
        self.decision_log.lock().unwrap().clone()
    }

    fn handle(&self, request: Bytes, handle: &RpcHandle) {
        {
            let mut script = self.script.lock().unwrap();
            if matches!(script.front(), Some(MasterReply::TransportFail)) {
                script.pop_front();
                handle.fail();
                return;
            }
        }
        match Request::decode(request).expect("well-formed request frame") {
            Request::Prepare(req) => {
                self.prepare_log.lock().unwrap().push(req);
                let (status, vote) = match self.script.lock().unwrap().pop_front() {
                    None => (Status::Ok, Vote::Commit),
                    Some(MasterReply::Prepare { status, vote }) => (status, vote),
                    Some(_) => panic!("script mismatch: master got a prepare"),
                };
                let mut buf = BytesMut::new();
                PrepareResponse { status, vote }.encode(&mut buf);
                handle.complete(buf.freeze());
            }
            Request::Decision(req) => {
                self.decision_log.lock().unwrap().push(req);
                let status = match self.script.lock().unwrap().pop_front() {
                    None => Status::Ok,
                    Some(MasterReply::Decision { status }) => status,
                    Some(_) => panic!("script mismatch: master got a decision"),
                };
                let mut buf = BytesMut::new();
                DecisionResponse { status }.encode(&mut buf);
                handle.complete(buf.freeze());
            }
        }
    }
}

type Delivery = (String, Vec<Bytes>, RpcHandle);

/// Loopback transport: sessions queue requests; `poll` delivers each to
/// its master and completes the RPC handle.
pub struct LoopbackTransport {
    masters: Mutex<HashMap<String, Arc<MasterNode>>>,
    pending: Arc<Mutex<Vec<Delivery>>>,
    flushed: Mutex<Vec<String>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackTransport {
            masters: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(Vec::new())),
            flushed: Mutex::new(Vec::new()),
        })
    }

    pub fn master(&self, locator: &str) -> Arc<MasterNode> {
        self.masters
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_insert_with(|| Arc::new(MasterNode::new(locator)))
            .clone()
    }

    /// Locators whose sessions the engine flushed, in order.
    pub fn flushed_sessions(&self) -> Vec<String> {
        self.flushed.lock().unwrap().clone()
    }
}

struct LoopbackSession {
    locator: String,
    pending: Arc<Mutex<Vec<Delivery>>>,
}

impl Session for LoopbackSession {
    fn service_locator(&self) -> &str {
        &self.locator
    }

    fn send_request(&self, parts: Vec<Bytes>) -> RpcHandle {
        let handle = RpcHandle::new();
        self.pending
            .lock()
            .unwrap()
            .push((self.locator.clone(), parts, handle.clone()));
        handle
    }
}

impl TransportManager for LoopbackTransport {
    fn open_session(&self, locator: &str) -> SessionRef {
        Arc::new(LoopbackSession {
            locator: locator.to_string(),
            pending: self.pending.clone(),
        })
    }

    fn flush_session(&self, locator: &str) {
        self.flushed.lock().unwrap().push(locator.to_string());
    }

    fn poll(&self) {
        let deliveries: Vec<Delivery> = std::mem::take(&mut *self.pending.lock().unwrap());
        for (locator, parts, handle) in deliveries {
            let master = self.masters.lock().unwrap().get(&locator).cloned();
            match master {
                Some(master) => {
                    let mut frame = BytesMut::new();
                    for part in &parts {
                        frame.extend_from_slice(part);
                    }
                    master.handle(frame.freeze(), &handle);
                }
                None => handle.fail(),
            }
        }
    }
}

/// Table directory with one full-keyspace tablet per table.
pub struct StaticDirectory {
    routes: Mutex<HashMap<u64, String>>,
    pub locate_calls: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(StaticDirectory {
            routes: Mutex::new(HashMap::new()),
            locate_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_route(&self, table_id: u64, locator: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(table_id, locator.to_string());
    }

    pub fn locate_count(&self) -> usize {
        self.locate_calls.load(Ordering::SeqCst)
    }
}

impl Directory for StaticDirectory {
    fn locate(&self, table_id: u64, _key_hash: u64) -> Result<TabletRoute> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        match self.routes.lock().unwrap().get(&table_id) {
            Some(locator) => Ok(TabletRoute {
                start_hash: 0,
                end_hash: u64::MAX,
                locator: locator.clone(),
            }),
            None => Err(TxError::Server(Status::TableDoesntExist)),
        }
    }
}

pub struct CountingIssuer {
    next: AtomicU64,
}

impl LeaseIssuer for CountingIssuer {
    fn issue(&self) -> Lease {
        Lease {
            lease_id: self.next.fetch_add(1, Ordering::SeqCst),
            lease_term_ms: 60_000,
        }
    }
}

/// The full in-memory cluster a test talks to.
pub struct TestCluster {
    pub transport: Arc<LoopbackTransport>,
    pub directory: Arc<StaticDirectory>,
    pub issuer: Arc<CountingIssuer>,
}

impl TestCluster {
    pub fn new() -> Self {
        init_logging();
        TestCluster {
            transport: LoopbackTransport::new(),
            directory: StaticDirectory::new(),
            issuer: Arc::new(CountingIssuer {
                next: AtomicU64::new(1),
            }),
        }
    }

    pub fn client(&self) -> Client {
        self.client_with(Config::default())
    }

    pub fn client_with(&self, config: Config) -> Client {
        Client::with_directory(
            self.directory.clone(),
            self.transport.clone(),
            self.issuer.clone(),
            config,
        )
    }

    /// Route `table_id` to `locator` and return that master, creating it
    /// on first use.
    pub fn add_master(&self, table_id: u64, locator: &str) -> Arc<MasterNode> {
        self.directory.set_route(table_id, locator);
        self.transport.master(locator)
    }

    /// Deliver every queued request to its master.
    pub fn deliver(&self) {
        TransportManager::poll(&*self.transport);
    }
}

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
