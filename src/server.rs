//! Server addresses and server pools.
//!
//! A [`Server`](struct.Server.html) is a cheaply cloneable handle: clones share the
//! message-id counter, the cached server information and, for mock servers, the
//! in-memory directory. A [`ServerPool`](struct.ServerPool.html) holds the servers a
//! connection may use and picks the next one to try when (re)connecting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::dit::Dit;
use crate::result::{LdapError, Result};
use crate::RequestId;

use percent_encoding::percent_decode;
use url::Url;

/// Connection scheme of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP, optionally upgraded with StartTLS.
    Ldap,
    /// TLS from the first byte.
    Ldaps,
    /// Unix domain socket.
    Ldapi,
}

/// Information about the directory server, read from its root DSE.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DsaInfo {
    pub naming_contexts: Vec<String>,
    pub supported_controls: Vec<String>,
    pub supported_extensions: Vec<String>,
    pub supported_sasl_mechanisms: Vec<String>,
    pub supported_ldap_version: Vec<String>,
    pub vendor_name: Option<String>,
    /// All attributes of the root DSE, by name as returned.
    pub other: HashMap<String, Vec<String>>,
}

impl DsaInfo {
    pub(crate) fn from_attrs(attrs: HashMap<String, Vec<String>>) -> DsaInfo {
        let get = |name: &str| {
            attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        DsaInfo {
            naming_contexts: get("namingContexts"),
            supported_controls: get("supportedControl"),
            supported_extensions: get("supportedExtension"),
            supported_sasl_mechanisms: get("supportedSASLMechanisms"),
            supported_ldap_version: get("supportedLDAPVersion"),
            vendor_name: get("vendorName").into_iter().next(),
            other: attrs,
        }
    }
}

struct ServerInner {
    host: String,
    port: u16,
    scheme: Scheme,
    path: Option<String>,
    message_id: Mutex<RequestId>,
    info: Mutex<Option<DsaInfo>>,
    dit: OnceLock<Arc<RwLock<Dit>>>,
}

/// Directory server address, with the state shared by every connection to it.
#[derive(Clone)]
pub struct Server(Arc<ServerInner>);

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("scheme", &self.0.scheme)
            .field("host", &self.0.host)
            .field("port", &self.0.port)
            .field("path", &self.0.path)
            .finish()
    }
}

impl Server {
    /// Parse an LDAP URL into a server.
    pub fn new(url: &str) -> Result<Server> {
        Server::from_url(&Url::parse(url)?)
    }

    /// Build a server from an already parsed LDAP URL.
    ///
    /// The `ldaps` scheme is only accepted when TLS support is compiled in. For
    /// `ldapi`, the percent-encoded socket path is taken from the host part of the
    /// URL and must be present, while a port must not be.
    pub fn from_url(url: &Url) -> Result<Server> {
        let (scheme, port, path) = match url.scheme() {
            "ldap" => (Scheme::Ldap, url.port().unwrap_or(389), None),
            #[cfg(feature = "tls-native")]
            "ldaps" => (Scheme::Ldaps, url.port().unwrap_or(636), None),
            "ldapi" => {
                let path = url.host_str().unwrap_or("");
                if path.is_empty() {
                    return Err(LdapError::EmptyUnixPath);
                }
                if url.port().is_some() || path.contains(':') {
                    return Err(LdapError::PortInUnixPath);
                }
                let dec_path = percent_decode(path.as_bytes()).decode_utf8_lossy();
                (Scheme::Ldapi, 0, Some(dec_path.into_owned()))
            }
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        };
        let host = match url.host_str() {
            _ if scheme == Scheme::Ldapi => String::new(),
            Some("") | None => String::from("localhost"),
            Some(h) => h.to_owned(),
        };
        Ok(Server::build(host, port, scheme, path, None))
    }

    /// A server backed by an in-memory directory, for use with the mock strategies.
    ///
    /// Every clone of the returned value, and every connection made to it, sees
    /// the same directory.
    pub fn mock(name: &str, dit: Dit) -> Server {
        Server::build(
            name.to_owned(),
            389,
            Scheme::Ldap,
            None,
            Some(Arc::new(RwLock::new(dit))),
        )
    }

    fn build(
        host: String,
        port: u16,
        scheme: Scheme,
        path: Option<String>,
        dit: Option<Arc<RwLock<Dit>>>,
    ) -> Server {
        let cell = OnceLock::new();
        if let Some(dit) = dit {
            let _ = cell.set(dit);
        }
        Server(Arc::new(ServerInner {
            host,
            port,
            scheme,
            path,
            message_id: Mutex::new(0),
            info: Mutex::new(None),
            dit: cell,
        }))
    }

    pub fn host(&self) -> &str {
        &self.0.host
    }

    pub fn port(&self) -> u16 {
        self.0.port
    }

    pub fn scheme(&self) -> Scheme {
        self.0.scheme
    }

    /// Socket path of an `ldapi` server.
    pub fn path(&self) -> Option<&str> {
        self.0.path.as_deref()
    }

    /// URL form of the server address.
    pub fn url(&self) -> String {
        match self.0.scheme {
            Scheme::Ldap => format!("ldap://{}:{}", self.0.host, self.0.port),
            Scheme::Ldaps => format!("ldaps://{}:{}", self.0.host, self.0.port),
            Scheme::Ldapi => format!("ldapi://{}", self.0.path.as_deref().unwrap_or("")),
        }
    }

    /// Assign the next message id.
    ///
    /// Ids are positive and strictly increasing until the counter would reach
    /// the largest 32-bit value, when it wraps back to 1. Zero is never returned.
    pub fn next_message_id(&self) -> RequestId {
        let mut id = self.0.message_id.lock().expect("message id mutex");
        *id = if *id >= RequestId::MAX - 1 { 1 } else { *id + 1 };
        *id
    }

    #[doc(hidden)]
    pub fn set_message_id(&self, id: RequestId) {
        *self.0.message_id.lock().expect("message id mutex") = id;
    }

    /// Cached server information, if it has been read.
    pub fn info(&self) -> Option<DsaInfo> {
        self.0.info.lock().expect("server info mutex").clone()
    }

    pub(crate) fn set_info(&self, info: Option<DsaInfo>) {
        *self.0.info.lock().expect("server info mutex") = info;
    }

    /// Directory of the server as seen by the mock strategies.
    ///
    /// A server not created with [`mock()`](#method.mock) gets an empty
    /// directory on first use.
    pub fn dit(&self) -> Arc<RwLock<Dit>> {
        self.0
            .dit
            .get_or_init(|| Arc::new(RwLock::new(Dit::new())))
            .clone()
    }

    /// True if both handles refer to the same server.
    pub fn same_as(&self, other: &Server) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Order in which a pool hands out its servers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolingStrategy {
    /// Always the first available server.
    #[default]
    First,
    /// The servers in turn.
    RoundRobin,
}

/// Set of servers a connection may use.
///
/// When an exhaust period is set, a server which failed to accept a connection
/// is skipped until the period has elapsed. If every server is being skipped,
/// [`get_server()`](#method.get_server) returns the recoverable
/// `PoolExhausted` error, so that a restarting connection keeps trying.
#[derive(Debug)]
pub struct ServerPool {
    servers: Vec<Server>,
    strategy: PoolingStrategy,
    next: AtomicUsize,
    exhaust: Option<Duration>,
    failed: Mutex<HashMap<usize, Instant>>,
}

impl ServerPool {
    pub fn new(servers: Vec<Server>, strategy: PoolingStrategy) -> ServerPool {
        ServerPool {
            servers,
            strategy,
            next: AtomicUsize::new(0),
            exhaust: None,
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Pool consisting of a single server.
    pub fn single(server: Server) -> ServerPool {
        ServerPool::new(vec![server], PoolingStrategy::First)
    }

    /// Skip failed servers for the given period.
    pub fn with_exhaust(mut self, period: Duration) -> Self {
        self.exhaust = Some(period);
        self
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn strategy(&self) -> PoolingStrategy {
        self.strategy
    }

    fn available(&self, idx: usize, failed: &mut HashMap<usize, Instant>) -> bool {
        let expired = match failed.get(&idx) {
            Some(when) => self.exhaust.map_or(true, |period| when.elapsed() >= period),
            None => return true,
        };
        if expired {
            failed.remove(&idx);
        }
        expired
    }

    /// Pick the next server to connect to.
    pub fn get_server(&self) -> Result<Server> {
        let count = self.servers.len();
        if count == 0 {
            return Err(LdapError::Configuration("empty server pool".into()));
        }
        let start = match self.strategy {
            PoolingStrategy::First => 0,
            PoolingStrategy::RoundRobin => self.next.fetch_add(1, Ordering::SeqCst) % count,
        };
        let mut failed = self.failed.lock().expect("server pool mutex");
        for offset in 0..count {
            let idx = (start + offset) % count;
            if self.available(idx, &mut failed) {
                if self.strategy == PoolingStrategy::RoundRobin && offset > 0 {
                    self.next.store(idx + 1, Ordering::SeqCst);
                }
                return Ok(self.servers[idx].clone());
            }
        }
        Err(LdapError::PoolExhausted)
    }

    /// Record that a connection to `server` couldn't be established.
    pub fn report_failure(&self, server: &Server) {
        if self.exhaust.is_none() {
            return;
        }
        if let Some(idx) = self.servers.iter().position(|s| s.same_as(server)) {
            debug!("server {} marked as exhausted", server.url());
            self.failed
                .lock()
                .expect("server pool mutex")
                .insert(idx, Instant::now());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_parsing() {
        let s = Server::new("ldap://ldap.example.org").unwrap();
        assert_eq!(s.host(), "ldap.example.org");
        assert_eq!(s.port(), 389);
        assert_eq!(s.scheme(), Scheme::Ldap);
        let s = Server::new("ldap://localhost:3389").unwrap();
        assert_eq!(s.port(), 3389);
        assert_eq!(s.url(), "ldap://localhost:3389");
        assert!(matches!(
            Server::new("http://example.org"),
            Err(LdapError::UnknownScheme(_))
        ));
    }

    #[test]
    fn ldapi_path() {
        let s = Server::new("ldapi://%2Fvar%2Frun%2Fldapi").unwrap();
        assert_eq!(s.path(), Some("/var/run/ldapi"));
        assert!(matches!(
            Server::new("ldapi://"),
            Err(LdapError::EmptyUnixPath)
        ));
    }

    #[test]
    fn message_ids_wrap_to_one() {
        let s = Server::new("ldap://localhost").unwrap();
        let ids = (0..5).map(|_| s.next_message_id()).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        s.set_message_id(RequestId::MAX - 2);
        assert_eq!(s.next_message_id(), RequestId::MAX - 1);
        assert_eq!(s.next_message_id(), 1);
    }

    #[test]
    fn clones_share_counter() {
        let s = Server::new("ldap://localhost").unwrap();
        let t = s.clone();
        s.next_message_id();
        assert_eq!(t.next_message_id(), 2);
        assert!(s.same_as(&t));
    }

    #[test]
    fn round_robin_skips_exhausted() {
        let a = Server::new("ldap://a").unwrap();
        let b = Server::new("ldap://b").unwrap();
        let pool = ServerPool::new(vec![a.clone(), b.clone()], PoolingStrategy::RoundRobin)
            .with_exhaust(Duration::from_secs(60));
        assert!(pool.get_server().unwrap().same_as(&a));
        assert!(pool.get_server().unwrap().same_as(&b));
        pool.report_failure(&a);
        assert!(pool.get_server().unwrap().same_as(&b));
        pool.report_failure(&b);
        assert!(matches!(pool.get_server(), Err(LdapError::PoolExhausted)));
        assert!(LdapError::PoolExhausted.is_recoverable());
    }

    #[test]
    fn first_without_exhaust_ignores_failures() {
        let a = Server::new("ldap://a").unwrap();
        let pool = ServerPool::single(a.clone());
        pool.report_failure(&a);
        assert!(pool.get_server().unwrap().same_as(&a));
    }
}
