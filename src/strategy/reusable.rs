//! Pool of worker connections behind one logical connection.
//!
//! Requests are numbered with a pool-wide counter and pushed onto a shared
//! FIFO queue. Each worker thread owns one restartable connection, takes the
//! next request off the queue, performs it, and leaves the outcome in the
//! incoming map under the request's counter, where the caller polls for it.
//!
//! Bind, unbind, StartTLS and abandon never reach the queue. They change the
//! pool-wide session flags which every worker consults before its next
//! request, and are answered at once with a canned result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::conn::{ClientStrategy, ConnState, LdapConnSettings};
use crate::exop::{Exop, STARTTLS_OID};
use crate::ldap::LdapConn;
use crate::protocol::MaybeControls;
use crate::request::{Envelope, Request};
use crate::result::{LdapError, LdapResult, Response, ResponseType, Result};
use crate::server::ServerPool;
use crate::RequestId;

pub(crate) const BIND_SENTINEL: RequestId = -1;
pub(crate) const UNBIND_SENTINEL: RequestId = -2;
pub(crate) const STARTTLS_SENTINEL: RequestId = -3;
pub(crate) const ABANDON_SENTINEL: RequestId = -4;

enum QueueItem {
    Request {
        counter: RequestId,
        request: Request,
        controls: MaybeControls,
    },
    Terminate,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    unfinished: usize,
}

/// Thread-safe FIFO with completion tracking.
///
/// Every pushed item must be acknowledged with `task_done()` once it has been
/// processed; `join()` blocks until all pushed items are acknowledged.
struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    finished: Condvar,
}

impl RequestQueue {
    fn new() -> RequestQueue {
        RequestQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            available: Condvar::new(),
            finished: Condvar::new(),
        }
    }

    fn push(&self, item: QueueItem) {
        let mut state = self.state.lock().expect("request queue mutex");
        state.items.push_back(item);
        state.unfinished += 1;
        self.available.notify_one();
    }

    /// Next item, or `None` if `timeout` elapsed first.
    fn pop(&self, timeout: Option<Duration>) -> Option<QueueItem> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().expect("request queue mutex");
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = match deadline {
                None => self.available.wait(state).expect("request queue mutex"),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .expect("request queue mutex")
                        .0
                }
            };
        }
    }

    fn task_done(&self) {
        let mut state = self.state.lock().expect("request queue mutex");
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.finished.notify_all();
        }
    }

    fn join(&self) {
        let mut state = self.state.lock().expect("request queue mutex");
        while state.unfinished > 0 {
            state = self.finished.wait(state).expect("request queue mutex");
        }
    }
}

/// What a pool worker is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Terminating,
}

impl WorkerState {
    fn from_u8(v: u8) -> WorkerState {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Busy,
            _ => WorkerState::Terminating,
        }
    }
}

/// Results left by the workers, and the counters nobody waits for anymore.
#[derive(Default)]
struct Incoming {
    results: HashMap<RequestId, Result<Response>>,
    timed_out: HashSet<RequestId>,
}

impl Incoming {
    fn deliver(&mut self, counter: RequestId, res: Result<Response>) {
        if self.timed_out.remove(&counter) {
            debug!("dropping late result for request {}", counter);
        } else {
            self.results.insert(counter, res);
        }
    }
}

/// State shared between the pool handle and its worker threads.
struct PoolShared {
    queue: RequestQueue,
    incoming: Mutex<Incoming>,
    open_pool: AtomicBool,
    bind_pool: AtomicBool,
    tls_pool: AtomicBool,
    bind_generation: AtomicU64,
    last_bind: Mutex<Option<Envelope>>,
}

/// Fixed-size pool of worker connections.
///
/// A pool shared through a [`PoolRegistry`](struct.PoolRegistry.html) counts the
/// connections which opened it, and its workers are stopped when the last of
/// them is closed.
pub struct ConnectionPool {
    name: String,
    size: usize,
    lifetime: Option<Duration>,
    keepalive: Option<Duration>,
    servers: Arc<ServerPool>,
    template: LdapConnSettings,
    shared: Arc<PoolShared>,
    counter: Mutex<RequestId>,
    started: AtomicBool,
    holders: AtomicUsize,
    workers: Mutex<Vec<(JoinHandle<()>, Arc<AtomicU8>)>>,
}

impl ConnectionPool {
    fn new(name: &str, servers: Arc<ServerPool>, settings: &LdapConnSettings) -> ConnectionPool {
        let mut template = settings.clone();
        template.strategy = ClientStrategy::Restartable;
        template.raise_errors = false;
        template.pool_registry = None;
        ConnectionPool {
            name: name.to_owned(),
            size: settings.pool_size.max(1),
            lifetime: settings.pool_lifetime,
            keepalive: settings.pool_keepalive,
            servers,
            template,
            shared: Arc::new(PoolShared {
                queue: RequestQueue::new(),
                incoming: Mutex::new(Incoming::default()),
                open_pool: AtomicBool::new(false),
                bind_pool: AtomicBool::new(false),
                tls_pool: AtomicBool::new(false),
                bind_generation: AtomicU64::new(0),
                last_bind: Mutex::new(None),
            }),
            counter: Mutex::new(0),
            started: AtomicBool::new(false),
            holders: AtomicUsize::new(0),
            workers: Mutex::new(vec![]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.lifetime
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of open connections using the pool.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Current state of every worker.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers
            .lock()
            .expect("pool workers mutex")
            .iter()
            .map(|(_, st)| WorkerState::from_u8(st.load(Ordering::SeqCst)))
            .collect()
    }

    fn next_counter(&self) -> RequestId {
        let mut c = self.counter.lock().expect("pool counter mutex");
        *c = if *c >= RequestId::MAX - 1 { 1 } else { *c + 1 };
        *c
    }

    fn new_worker_conn(&self) -> Result<LdapConn> {
        LdapConn::from_shared_pool(self.servers.clone(), self.template.clone())
    }

    /// Start the worker threads, if they aren't running.
    pub fn start_pool(&self) -> Result<()> {
        let mut workers = self.workers.lock().expect("pool workers mutex");
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        for i in 0..self.size {
            let worker = Worker {
                conn: self.new_worker_conn()?,
                created: Instant::now(),
                bind_generation: 0,
                state: Arc::new(AtomicU8::new(WorkerState::Idle as u8)),
                shared: self.shared.clone(),
                servers: self.servers.clone(),
                template: self.template.clone(),
                lifetime: self.lifetime,
                keepalive: self.keepalive,
            };
            let state = worker.state.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", self.name, i))
                .spawn(move || worker.run())?;
            workers.push((handle, state));
        }
        self.started.store(true, Ordering::SeqCst);
        debug!("pool {} started with {} workers", self.name, self.size);
        Ok(())
    }

    /// Wait for all queued requests, then stop every worker.
    pub fn terminate_pool(&self) {
        let mut workers = self.workers.lock().expect("pool workers mutex");
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.join();
        for _ in 0..workers.len() {
            self.shared.queue.push(QueueItem::Terminate);
        }
        for (handle, _) in workers.drain(..) {
            if handle.join().is_err() {
                warn!("pool {} worker panicked", self.name);
            }
        }
        debug!("pool {} terminated", self.name);
    }

    fn submit(&self, request: Request, controls: MaybeControls) -> RequestId {
        let counter = self.next_counter();
        self.shared.queue.push(QueueItem::Request {
            counter,
            request,
            controls,
        });
        counter
    }

    fn wait_for(&self, counter: RequestId, poll: Duration, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut incoming = self.shared.incoming.lock().expect("pool incoming mutex");
                if let Some(res) = incoming.results.remove(&counter) {
                    return res;
                }
                if Instant::now() >= deadline {
                    incoming.timed_out.insert(counter);
                    return Err(LdapError::ResponseTimeout(timeout));
                }
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.terminate_pool();
    }
}

struct Worker {
    conn: LdapConn,
    created: Instant,
    bind_generation: u64,
    state: Arc<AtomicU8>,
    shared: Arc<PoolShared>,
    servers: Arc<ServerPool>,
    template: LdapConnSettings,
    lifetime: Option<Duration>,
    keepalive: Option<Duration>,
}

impl Worker {
    fn set_state(&self, st: WorkerState) {
        self.state.store(st as u8, Ordering::SeqCst);
    }

    fn run(mut self) {
        let name = thread::current().name().unwrap_or("pool-worker").to_owned();
        debug!("{} running", name);
        loop {
            let item = match self.shared.queue.pop(self.keepalive) {
                Some(item) => item,
                None => {
                    if !self.conn.is_closed() {
                        trace!("{} keepalive", name);
                        if let Err(e) = self.conn.send(Request::Abandon(0)) {
                            debug!("{} keepalive failed: {}", name, e);
                        }
                    }
                    continue;
                }
            };
            match item {
                QueueItem::Terminate => {
                    self.set_state(WorkerState::Terminating);
                    if !self.conn.is_closed() {
                        if let Err(e) = self.conn.unbind() {
                            debug!("{} unbind failed: {}", name, e);
                        }
                    }
                    self.shared.queue.task_done();
                    debug!("{} terminated", name);
                    break;
                }
                QueueItem::Request {
                    counter,
                    request,
                    controls,
                } => {
                    self.set_state(WorkerState::Busy);
                    let res = self.execute(request, controls);
                    self.shared
                        .incoming
                        .lock()
                        .expect("pool incoming mutex")
                        .deliver(counter, res);
                    self.set_state(WorkerState::Idle);
                    self.shared.queue.task_done();
                }
            }
        }
    }

    fn renew_if_expired(&mut self) -> Result<()> {
        if let Some(lifetime) = self.lifetime {
            if self.created.elapsed() > lifetime {
                debug!("pooled connection expired, replacing it");
                self.conn.close();
                self.conn = LdapConn::from_shared_pool(self.servers.clone(), self.template.clone())?;
                self.created = Instant::now();
                self.bind_generation = 0;
            }
        }
        Ok(())
    }

    /// Bring the worker's session in line with the pool-wide flags.
    ///
    /// A closed connection is reopened through its restartable strategy, so a
    /// transport failure is retried the same way as during an operation.
    fn ensure_session(&mut self) -> Result<()> {
        let generation = self.shared.bind_generation.load(Ordering::SeqCst);
        let bind_pool = self.shared.bind_pool.load(Ordering::SeqCst);
        let tls_pool = self.shared.tls_pool.load(Ordering::SeqCst);
        let last_bind = self.shared.last_bind.lock().expect("pool bind mutex").clone();
        if self.shared.open_pool.load(Ordering::SeqCst) && self.conn.is_closed() {
            if !bind_pool {
                self.conn.state.last_bind = None;
            }
            self.conn.open()?;
            if tls_pool && !self.conn.tls_started() {
                self.conn.start_tls()?;
            }
            self.bind_generation = 0;
        }
        if bind_pool && self.bind_generation != generation {
            if let Some(bind) = last_bind {
                self.conn.perform_with(bind.request, bind.controls)?.success()?;
            }
            self.bind_generation = generation;
        }
        Ok(())
    }

    fn execute(&mut self, request: Request, controls: MaybeControls) -> Result<Response> {
        self.renew_if_expired()?;
        self.ensure_session()?;
        self.conn.perform_with(request, controls)
    }
}

/// Named pools, shared between the connections which are given the registry.
#[derive(Clone, Default)]
pub struct PoolRegistry(Arc<Mutex<HashMap<String, Arc<ConnectionPool>>>>);

impl PoolRegistry {
    pub fn new() -> PoolRegistry {
        PoolRegistry::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.0.lock().expect("pool registry mutex").get(name).cloned()
    }

    /// Names of the registered pools.
    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .0
            .lock()
            .expect("pool registry mutex")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Unregister a pool. Its workers stop when the last handle is dropped.
    pub fn remove(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.0.lock().expect("pool registry mutex").remove(name)
    }

    /// The pool registered under `name`, created if missing. A stopped pool
    /// whose size or lifetime differs from the settings is replaced.
    fn get_or_create(
        &self,
        name: &str,
        servers: &Arc<ServerPool>,
        settings: &LdapConnSettings,
    ) -> Result<Arc<ConnectionPool>> {
        if name.is_empty() {
            return Err(LdapError::InvalidPoolName);
        }
        let mut pools = self.0.lock().expect("pool registry mutex");
        if let Some(pool) = pools.get(name) {
            let same_shape = pool.size == settings.pool_size.max(1)
                && pool.lifetime == settings.pool_lifetime;
            if same_shape || pool.started() {
                return Ok(pool.clone());
            }
        }
        let pool = Arc::new(ConnectionPool::new(name, servers.clone(), settings));
        pools.insert(name.to_owned(), pool.clone());
        Ok(pool)
    }
}

pub(crate) struct Reusable {
    pool: Arc<ConnectionPool>,
    holding: bool,
}

impl Reusable {
    pub fn new(state: &ConnState) -> Result<Reusable> {
        let name = state.settings.pool_name.as_str();
        let pool = match state.settings.pool_registry {
            Some(ref registry) => registry.get_or_create(name, &state.pool, &state.settings)?,
            None if name.is_empty() => return Err(LdapError::InvalidPoolName),
            None => Arc::new(ConnectionPool::new(name, state.pool.clone(), &state.settings)),
        };
        Ok(Reusable {
            pool,
            holding: false,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn open(&mut self, state: &mut ConnState) -> Result<()> {
        self.pool.shared.open_pool.store(true, Ordering::SeqCst);
        self.pool.start_pool()?;
        if !self.holding {
            self.pool.holders.fetch_add(1, Ordering::SeqCst);
            self.holding = true;
        }
        state.open_virtual();
        Ok(())
    }

    /// Release the pool. The last holder to close it stops the workers.
    pub fn close(&mut self, state: &mut ConnState) {
        if self.holding {
            self.holding = false;
            if self.pool.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.pool.terminate_pool();
                self.pool.shared.open_pool.store(false, Ordering::SeqCst);
            } else {
                debug!("pool {} still in use, workers kept", self.pool.name);
            }
        }
        state.closed = true;
        state.listening = false;
        state.bound = false;
    }

    pub fn send(
        &mut self,
        state: &mut ConnState,
        req: Request,
        controls: MaybeControls,
    ) -> Result<RequestId> {
        if !self.pool.started() {
            return Err(LdapError::PoolNotStarted(
                "reusable connection pool not started".into(),
            ));
        }
        let shared = &self.pool.shared;
        Ok(match req {
            Request::Bind { .. } => {
                let env = Envelope {
                    request: req,
                    controls,
                };
                *shared.last_bind.lock().expect("pool bind mutex") = Some(env.clone());
                state.last_bind = Some(env);
                shared.bind_pool.store(true, Ordering::SeqCst);
                shared.open_pool.store(true, Ordering::SeqCst);
                shared.bind_generation.fetch_add(1, Ordering::SeqCst);
                BIND_SENTINEL
            }
            Request::Unbind => {
                shared.bind_pool.store(false, Ordering::SeqCst);
                UNBIND_SENTINEL
            }
            Request::Extended(ref exop) if exop.is_starttls() => {
                shared.tls_pool.store(true, Ordering::SeqCst);
                STARTTLS_SENTINEL
            }
            Request::Abandon(_) => ABANDON_SENTINEL,
            req => self.pool.submit(req, controls),
        })
    }

    pub fn get_response(
        &mut self,
        state: &mut ConnState,
        id: RequestId,
    ) -> Result<Option<Response>> {
        match id {
            BIND_SENTINEL => {
                state.bound = true;
                Ok(Some(bogus_bind_response()))
            }
            UNBIND_SENTINEL => {
                state.bound = false;
                Ok(None)
            }
            STARTTLS_SENTINEL | ABANDON_SENTINEL => Ok(Some(bogus_starttls_response())),
            counter => self
                .pool
                .wait_for(
                    counter,
                    state.settings.response_poll,
                    state.settings.response_timeout,
                )
                .map(Some),
        }
    }
}

pub(crate) fn bogus_bind_response() -> Response {
    Response::from_result(LdapResult::new(
        ResponseType::BindResponse,
        0,
        "<bogus Bind response>",
    ))
}

/// Canned answer to StartTLS, also given for abandon.
pub(crate) fn bogus_starttls_response() -> Response {
    let mut resp = Response::from_result(LdapResult::new(
        ResponseType::ExtendedResp,
        0,
        "<bogus StartTls response>",
    ));
    resp.exop = Exop {
        name: Some(STARTTLS_OID.to_owned()),
        val: Some(b"None".to_vec()),
    };
    resp
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sentinel_shapes() {
        let bind = bogus_bind_response();
        assert_eq!(bind.result.rc, 0);
        assert_eq!(bind.result.description(), "success");
        assert_eq!(bind.result.rtype.name(), "bindResponse");
        assert_eq!(bind.result.matched, "");
        assert_eq!(bind.result.text, "<bogus Bind response>");
        assert!(bind.sasl_creds.is_none());

        let tls = bogus_starttls_response();
        assert_eq!(tls.result.rc, 0);
        assert_eq!(tls.result.rtype.name(), "extendedResp");
        assert_eq!(tls.result.text, "<bogus StartTls response>");
        assert_eq!(tls.exop.name.as_deref(), Some("1.3.6.1.4.1.1466.20037"));
        assert_eq!(tls.exop.val.as_deref(), Some(&b"None"[..]));
    }

    #[test]
    fn queue_join_waits_for_task_done() {
        let queue = Arc::new(RequestQueue::new());
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            queue.push(QueueItem::Terminate);
        }
        let handles = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let item = queue.pop(None);
                    assert!(matches!(item, Some(QueueItem::Terminate)));
                    thread::sleep(Duration::from_millis(20));
                    done.fetch_add(1, Ordering::SeqCst);
                    queue.task_done();
                })
            })
            .collect::<Vec<_>>();
        queue.join();
        assert_eq!(done.load(Ordering::SeqCst), 3);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn queue_pop_times_out() {
        let queue = RequestQueue::new();
        let start = Instant::now();
        assert!(queue.pop(Some(Duration::from_millis(30))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn registry_rejects_empty_name() {
        let registry = PoolRegistry::new();
        let servers = Arc::new(ServerPool::single(
            crate::server::Server::new("ldap://localhost").unwrap(),
        ));
        let res = registry.get_or_create("", &servers, &LdapConnSettings::new());
        assert!(matches!(res, Err(LdapError::InvalidPoolName)));
        let a = registry
            .get_or_create("p", &servers, &LdapConnSettings::new())
            .unwrap();
        let b = registry
            .get_or_create("p", &servers, &LdapConnSettings::new())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.names(), vec!["p".to_owned()]);
    }

    #[test]
    fn late_results_are_dropped() {
        let servers = Arc::new(ServerPool::single(
            crate::server::Server::new("ldap://localhost").unwrap(),
        ));
        let pool = ConnectionPool::new("late", servers, &LdapConnSettings::new());
        let err = pool
            .wait_for(7, Duration::from_millis(1), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, LdapError::ResponseTimeout(_)));
        let mut incoming = pool.shared.incoming.lock().unwrap();
        incoming.deliver(7, Ok(bogus_bind_response()));
        assert!(incoming.results.is_empty());
        assert!(incoming.timed_out.is_empty());
        incoming.deliver(8, Ok(bogus_bind_response()));
        drop(incoming);
        let resp = pool
            .wait_for(8, Duration::from_millis(1), Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.result.text, "<bogus Bind response>");
        assert!(pool.shared.incoming.lock().unwrap().results.is_empty());
    }

    #[test]
    fn counter_wraps_to_one() {
        let servers = Arc::new(ServerPool::single(
            crate::server::Server::new("ldap://localhost").unwrap(),
        ));
        let pool = ConnectionPool::new("c", servers, &LdapConnSettings::new());
        *pool.counter.lock().unwrap() = RequestId::MAX - 2;
        assert_eq!(pool.next_counter(), RequestId::MAX - 1);
        assert_eq!(pool.next_counter(), 1);
    }
}
