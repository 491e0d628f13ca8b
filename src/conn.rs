use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{LdapCodec, MaybeControls};
use crate::request::{Envelope, Request};
use crate::result::{LdapError, ResponseType, Result};
use crate::server::{Scheme, Server, ServerPool};
use crate::strategy::PoolRegistry;
use crate::RequestId;

use bytes::BytesMut;
#[cfg(feature = "tls-native")]
use native_tls::{HandshakeError, TlsConnector, TlsStream};
use tokio_util::codec::Encoder;

pub(crate) enum ConnType {
    Tcp(TcpStream),
    #[cfg(feature = "tls-native")]
    Tls(TlsStream<TcpStream>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for ConnType {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ConnType::Tcp(ts) => ts.read(buf),
            #[cfg(feature = "tls-native")]
            ConnType::Tls(tls) => tls.read(buf),
            #[cfg(unix)]
            ConnType::Unix(us) => us.read(buf),
        }
    }
}

impl Write for ConnType {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ConnType::Tcp(ts) => ts.write(buf),
            #[cfg(feature = "tls-native")]
            ConnType::Tls(tls) => tls.write(buf),
            #[cfg(unix)]
            ConnType::Unix(us) => us.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ConnType::Tcp(ts) => ts.flush(),
            #[cfg(feature = "tls-native")]
            ConnType::Tls(tls) => tls.flush(),
            #[cfg(unix)]
            ConnType::Unix(us) => us.flush(),
        }
    }
}

impl ConnType {
    fn shutdown(&mut self) -> io::Result<()> {
        match self {
            ConnType::Tcp(ts) => ts.shutdown(Shutdown::Both),
            #[cfg(feature = "tls-native")]
            ConnType::Tls(tls) => tls.shutdown(),
            #[cfg(unix)]
            ConnType::Unix(us) => us.shutdown(Shutdown::Both),
        }
    }
}

/// Execution model of a connection.
///
/// The strategy determines how an operation travels to the server and how
/// its result comes back. Synchronous strategies return the result from the
/// operation call itself, while `Reusable` and `MockAsync` hand out a message
/// id to be redeemed with [`get_response()`](crate::LdapConn::get_response);
/// the operation methods of [`LdapConn`](crate::LdapConn) hide the difference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientStrategy {
    /// One operation at a time on one socket.
    #[default]
    Sync,
    /// Like `Sync`, but transport failures are retried on a fresh socket.
    Restartable,
    /// A pool of restartable connections served by worker threads.
    Reusable,
    /// Operations are rendered as LDIF change records instead of being sent.
    Ldif,
    /// In-memory directory, results returned directly.
    MockSync,
    /// In-memory directory, results redeemed by message id.
    MockAsync,
}

impl FromStr for ClientStrategy {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<ClientStrategy> {
        Ok(match s {
            "SYNC" => ClientStrategy::Sync,
            "RESTARTABLE" => ClientStrategy::Restartable,
            "REUSABLE" => ClientStrategy::Reusable,
            "LDIF" => ClientStrategy::Ldif,
            "MOCK_SYNC" => ClientStrategy::MockSync,
            "MOCK_ASYNC" => ClientStrategy::MockAsync,
            _ => {
                return Err(LdapError::Configuration(format!(
                    "unknown client strategy: {}",
                    s
                )))
            }
        })
    }
}

pub(crate) const DEFAULT_POOL_NAME: &str = "REUSABLE_DEFAULT_POOL";

/// Additional settings for an LDAP connection.
///
/// The structure is opaque for better extensibility. An instance with
/// default values is constructed by [`new()`](#method.new), and all
/// available settings can be replaced through a builder-like interface,
/// by calling the appropriate functions.
#[derive(Clone)]
pub struct LdapConnSettings {
    pub(crate) conn_timeout: Option<Duration>,
    pub(crate) receive_timeout: Option<Duration>,
    #[cfg(feature = "tls-native")]
    pub(crate) connector: Option<TlsConnector>,
    pub(crate) starttls: bool,
    pub(crate) no_tls_verify: bool,
    pub(crate) strategy: ClientStrategy,
    pub(crate) raise_errors: bool,
    pub(crate) auto_referrals: bool,
    pub(crate) referral_hop_limit: u32,
    pub(crate) allowed_referral_hosts: Vec<(String, bool)>,
    pub(crate) collect_usage: bool,
    pub(crate) read_server_info: bool,
    pub(crate) read_only: bool,
    pub(crate) restart_sleep: Duration,
    pub(crate) restart_tries: Option<u32>,
    pub(crate) pool_name: String,
    pub(crate) pool_size: usize,
    pub(crate) pool_lifetime: Option<Duration>,
    pub(crate) pool_keepalive: Option<Duration>,
    pub(crate) response_poll: Duration,
    pub(crate) response_timeout: Duration,
    pub(crate) socket_size: usize,
    pub(crate) pool_registry: Option<PoolRegistry>,
}

impl Default for LdapConnSettings {
    fn default() -> Self {
        LdapConnSettings {
            conn_timeout: None,
            receive_timeout: None,
            #[cfg(feature = "tls-native")]
            connector: None,
            starttls: false,
            no_tls_verify: false,
            strategy: ClientStrategy::Sync,
            raise_errors: false,
            auto_referrals: true,
            referral_hop_limit: 15,
            allowed_referral_hosts: vec![("*".to_owned(), true)],
            collect_usage: false,
            read_server_info: false,
            read_only: false,
            restart_sleep: Duration::from_secs(2),
            restart_tries: Some(30),
            pool_name: DEFAULT_POOL_NAME.to_owned(),
            pool_size: 5,
            pool_lifetime: Some(Duration::from_secs(3600)),
            pool_keepalive: None,
            response_poll: Duration::from_millis(50),
            response_timeout: Duration::from_secs(10),
            socket_size: 4096,
            pool_registry: None,
        }
    }
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Set the connection timeout. If a connetion to the server can't
    /// be established before the timeout expires, an error will be
    /// returned to the user. Defaults to `None`, meaning an infinite
    /// timeout.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    /// Set the receive timeout, bounding every blocking read while waiting
    /// for a response. Defaults to `None`, meaning an infinite timeout.
    pub fn set_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    #[cfg(feature = "tls-native")]
    /// Set a custom TLS connector, which enables setting various options
    /// when establishing a secure connection. The default of `None` will
    /// use a connector with default settings.
    pub fn set_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// If `true`, use the StartTLS extended operation to establish a
    /// secure connection when opening. Defaults to `false`.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    /// The `starttls` settings indicates whether the StartTLS extended
    /// operation will be used to establish a secure connection.
    pub fn starttls(&self) -> bool {
        self.starttls
    }

    /// If `true`, try to establish a TLS connection without certificate
    /// verification. Defaults to `false`.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    /// Select the client strategy. Defaults to `ClientStrategy::Sync`.
    pub fn set_strategy(mut self, strategy: ClientStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> ClientStrategy {
        self.strategy
    }

    /// If `true`, an operation whose result code isn't one of success,
    /// compareFalse, compareTrue, referral or saslBindInProgress returns
    /// `LdapError::LdapResult` instead of the result. Defaults to `false`.
    pub fn set_raise_errors(mut self, raise_errors: bool) -> Self {
        self.raise_errors = raise_errors;
        self
    }

    /// Follow referrals automatically. Defaults to `true`.
    pub fn set_auto_referrals(mut self, auto_referrals: bool) -> Self {
        self.auto_referrals = auto_referrals;
        self
    }

    /// Maximum depth of chained referrals. Defaults to 15.
    pub fn set_referral_hop_limit(mut self, limit: u32) -> Self {
        self.referral_hop_limit = limit;
        self
    }

    /// Hosts which may be contacted when following referrals, each with a flag
    /// saying whether the current credentials may be sent there. The host `*`
    /// matches any host. Defaults to `[("*", true)]`.
    pub fn set_allowed_referral_hosts(mut self, hosts: Vec<(String, bool)>) -> Self {
        self.allowed_referral_hosts = hosts;
        self
    }

    /// Collect usage statistics. Defaults to `false`.
    pub fn set_collect_usage(mut self, collect_usage: bool) -> Self {
        self.collect_usage = collect_usage;
        self
    }

    /// Read the root DSE of the server after opening. Defaults to `false`.
    pub fn set_read_server_info(mut self, read_server_info: bool) -> Self {
        self.read_server_info = read_server_info;
        self
    }

    /// Refuse write operations locally. Defaults to `false`.
    pub fn set_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Pause between restart attempts. Defaults to two seconds.
    pub fn set_restart_sleep(mut self, sleep: Duration) -> Self {
        self.restart_sleep = sleep;
        self
    }

    /// Number of restart attempts after a failure, `None` meaning no limit.
    /// Defaults to 30.
    pub fn set_restart_tries(mut self, tries: Option<u32>) -> Self {
        self.restart_tries = tries;
        self
    }

    /// Name under which a reusable pool is registered.
    pub fn set_pool_name(mut self, name: &str) -> Self {
        self.pool_name = name.to_owned();
        self
    }

    /// Number of connections in a reusable pool. Defaults to 5.
    pub fn set_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Maximum age of a pooled connection before it's replaced, `None`
    /// meaning no limit. Defaults to one hour.
    pub fn set_pool_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.pool_lifetime = lifetime;
        self
    }

    /// If set, an idle pooled connection sends an Abandon(0) at this interval
    /// to keep the session alive. Defaults to `None`.
    pub fn set_pool_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.pool_keepalive = keepalive;
        self
    }

    /// Interval between checks for a pooled result. Defaults to 50 ms.
    pub fn set_response_poll(mut self, poll: Duration) -> Self {
        self.response_poll = poll;
        self
    }

    /// How long to wait for a pooled result. Defaults to ten seconds.
    pub fn set_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Size of a single socket read. Defaults to 4096 bytes.
    pub fn set_socket_size(mut self, size: usize) -> Self {
        self.socket_size = size.max(1);
        self
    }

    /// Registry of reusable pools. Connections given the same registry and pool
    /// name share one pool; without a registry every connection starts its own.
    /// A shared pool keeps its workers until the last connection which opened
    /// it is closed.
    pub fn set_pool_registry(mut self, registry: PoolRegistry) -> Self {
        self.pool_registry = Some(registry);
        self
    }
}

/// Usage statistics of a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub bytes_transmitted: u64,
    pub bytes_received: u64,
    pub messages_transmitted: u64,
    pub messages_received: u64,
    /// Requests sent, by protocol name.
    pub operations: HashMap<&'static str, u64>,
    pub referrals_received: u64,
    pub referrals_followed: u64,
    pub restartable_failures: u64,
    pub restartable_successes: u64,
    pub servers_from_pool: u64,
    pub open_sockets: u64,
    pub closed_sockets: u64,
}

impl Usage {
    fn transmitted(&mut self, req: &Request, bytes: usize) {
        self.bytes_transmitted += bytes as u64;
        self.messages_transmitted += 1;
        *self.operations.entry(req.name()).or_insert(0) += 1;
    }

    pub(crate) fn received(&mut self, rtype: ResponseType, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += 1;
        if rtype == ResponseType::SearchResRef {
            self.referrals_received += 1;
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Connection usage:")?;
        writeln!(f, "  sockets opened/closed: {}/{}", self.open_sockets, self.closed_sockets)?;
        writeln!(f, "  servers from pool: {}", self.servers_from_pool)?;
        writeln!(
            f,
            "  restartable successes/failures: {}/{}",
            self.restartable_successes, self.restartable_failures
        )?;
        writeln!(
            f,
            "  bytes sent/received: {}/{}",
            self.bytes_transmitted, self.bytes_received
        )?;
        writeln!(
            f,
            "  messages sent/received: {}/{}",
            self.messages_transmitted, self.messages_received
        )?;
        writeln!(
            f,
            "  referrals received/followed: {}/{}",
            self.referrals_received, self.referrals_followed
        )?;
        let mut ops = self.operations.iter().collect::<Vec<_>>();
        ops.sort();
        for (name, count) in ops {
            writeln!(f, "  {}: {}", name, count)?;
        }
        Ok(())
    }
}

/// Mutable state of one logical connection.
///
/// Owned by `LdapConn` and handed to the strategy on every call.
pub(crate) struct ConnState {
    pub server: Server,
    pub pool: Arc<ServerPool>,
    pub settings: LdapConnSettings,
    pub stream: Option<ConnType>,
    pub buffer: BytesMut,
    pub codec: LdapCodec,
    pub closed: bool,
    pub bound: bool,
    pub listening: bool,
    pub tls_started: bool,
    pub last_error: Option<String>,
    pub outstanding: HashMap<RequestId, Envelope>,
    /// Abandoned ids whose late responses are discarded.
    pub abandoned: HashSet<RequestId>,
    pub usage: Usage,
    /// Last successful bind, replayed after a reconnection.
    pub last_bind: Option<Envelope>,
    pub referral_depth: u32,
}

impl ConnState {
    pub fn new(pool: Arc<ServerPool>, server: Server, settings: LdapConnSettings) -> ConnState {
        ConnState {
            server,
            pool,
            settings,
            stream: None,
            buffer: BytesMut::new(),
            codec: LdapCodec,
            closed: true,
            bound: false,
            listening: false,
            tls_started: false,
            last_error: None,
            outstanding: HashMap::new(),
            abandoned: HashSet::new(),
            usage: Usage::default(),
            last_bind: None,
            referral_depth: 0,
        }
    }

    pub fn set_error(&mut self, e: &LdapError) {
        self.last_error = Some(e.to_string());
    }

    /// Take a server from the pool and connect a socket to it.
    pub fn open_socket(&mut self) -> Result<()> {
        let server = self.pool.get_server()?;
        if self.settings.collect_usage {
            self.usage.servers_from_pool += 1;
        }
        let stream = match connect(&server, &self.settings) {
            Ok(stream) => stream,
            Err(e) => {
                self.pool.report_failure(&server);
                self.set_error(&e);
                return Err(e);
            }
        };
        debug!("socket opened to {}", server.url());
        self.server = server;
        self.stream = Some(stream);
        self.buffer.clear();
        self.closed = false;
        self.listening = true;
        self.tls_started = false;
        if self.settings.collect_usage {
            self.usage.open_sockets += 1;
        }
        if self.server.scheme() == Scheme::Ldaps {
            self.wrap_tls()?;
        }
        Ok(())
    }

    /// Mark the connection open without a socket, for the strategies which
    /// never touch the network.
    pub fn open_virtual(&mut self) {
        self.closed = false;
        self.listening = true;
    }

    /// Shut the socket down, ignoring errors.
    pub fn close_socket(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown() {
                debug!("socket shutdown error: {}", e);
            }
            if self.settings.collect_usage {
                self.usage.closed_sockets += 1;
            }
        }
        self.buffer.clear();
        self.closed = true;
        self.listening = false;
        self.bound = false;
        self.tls_started = false;
    }

    /// Encode and write one message.
    pub fn write_message(
        &mut self,
        id: RequestId,
        req: &Request,
        controls: MaybeControls,
    ) -> Result<()> {
        let stream = match self.stream {
            Some(ref mut stream) if self.listening => stream,
            _ => {
                return Err(LdapError::SocketNotOpen(
                    "unable to send message, socket is not open".into(),
                ))
            }
        };
        let mut buf = BytesMut::new();
        self.codec.encode((id, req.to_tag(), controls), &mut buf)?;
        trace!("sending {} bytes, id={}", buf.len(), id);
        if let Err(e) = stream.write_all(&buf).and_then(|_| stream.flush()) {
            let e = LdapError::from(e);
            self.set_error(&e);
            self.close_socket();
            return Err(e);
        }
        if self.settings.collect_usage {
            self.usage.transmitted(req, buf.len());
        }
        Ok(())
    }

    /// Read one chunk from the socket into the buffer, returning the number
    /// of bytes read. End of stream closes the socket.
    pub fn read_chunk(&mut self) -> Result<usize> {
        let stream = match self.stream {
            Some(ref mut stream) => stream,
            None => {
                return Err(LdapError::SocketNotOpen(
                    "unable to receive message, socket is not open".into(),
                ))
            }
        };
        let mut chunk = vec![0u8; self.settings.socket_size];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.close_socket();
                let e = LdapError::EndOfStream;
                self.set_error(&e);
                Err(e)
            }
            Ok(n) => {
                trace!("received {} bytes", n);
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) => {
                let e = LdapError::from(e);
                self.set_error(&e);
                self.close_socket();
                Err(e)
            }
        }
    }

    #[cfg(feature = "tls-native")]
    /// Replace the TCP stream with a TLS stream over it.
    pub fn wrap_tls(&mut self) -> Result<()> {
        let tcp = match self.stream.take() {
            Some(ConnType::Tcp(tcp)) => tcp,
            Some(other) => {
                self.stream = Some(other);
                return Err(LdapError::Configuration(
                    "TLS can only be started on a TCP stream".into(),
                ));
            }
            None => {
                return Err(LdapError::SocketNotOpen(
                    "unable to start TLS, socket is not open".into(),
                ))
            }
        };
        let connector = match self.settings.connector {
            Some(ref connector) => connector.clone(),
            None => create_connector(&self.settings)?,
        };
        match connector.connect(self.server.host(), tcp) {
            Ok(tls) => {
                self.stream = Some(ConnType::Tls(tls));
                self.tls_started = true;
                debug!("TLS established with {}", self.server.url());
                Ok(())
            }
            Err(e) => {
                self.close_socket();
                let e = match e {
                    HandshakeError::Failure(e) => LdapError::from(e),
                    HandshakeError::WouldBlock(_) => {
                        LdapError::from(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                };
                self.set_error(&e);
                Err(e)
            }
        }
    }

    #[cfg(not(feature = "tls-native"))]
    pub fn wrap_tls(&mut self) -> Result<()> {
        Err(LdapError::Configuration("no TLS support compiled in".into()))
    }
}

#[cfg(feature = "tls-native")]
fn create_connector(settings: &LdapConnSettings) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();
    if settings.no_tls_verify {
        builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}

fn connect(server: &Server, settings: &LdapConnSettings) -> Result<ConnType> {
    if server.scheme() == Scheme::Ldapi {
        return connect_unix(server, settings);
    }
    let addrs = (server.host(), server.port()).to_socket_addrs()?;
    let mut last_err = None;
    for addr in addrs {
        let res = match settings.conn_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match res {
            Ok(stream) => {
                stream.set_read_timeout(settings.receive_timeout)?;
                stream.set_nodelay(true)?;
                return Ok(ConnType::Tcp(stream));
            }
            Err(e) => {
                debug!("connection to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => LdapError::from(e),
        None => LdapError::from(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}", server.host()),
        )),
    })
}

#[cfg(unix)]
fn connect_unix(server: &Server, settings: &LdapConnSettings) -> Result<ConnType> {
    let path = server.path().ok_or(LdapError::EmptyUnixPath)?;
    let stream = UnixStream::connect(path)?;
    stream.set_read_timeout(settings.receive_timeout)?;
    Ok(ConnType::Unix(stream))
}

#[cfg(not(unix))]
fn connect_unix(_server: &Server, _settings: &LdapConnSettings) -> Result<ConnType> {
    Err(LdapError::Configuration(
        "no Unix domain sockets on non-Unix platforms".into(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strategy_names() {
        assert_eq!(
            "RESTARTABLE".parse::<ClientStrategy>().unwrap(),
            ClientStrategy::Restartable
        );
        assert_eq!(
            "MOCK_ASYNC".parse::<ClientStrategy>().unwrap(),
            ClientStrategy::MockAsync
        );
        let err = "ASYNC".parse::<ClientStrategy>().unwrap_err();
        assert_eq!(err.kind(), crate::result::ErrorKind::Configuration);
    }

    #[test]
    fn settings_defaults() {
        let s = LdapConnSettings::new();
        assert_eq!(s.strategy(), ClientStrategy::Sync);
        assert_eq!(s.restart_tries, Some(30));
        assert_eq!(s.restart_sleep, Duration::from_secs(2));
        assert_eq!(s.pool_name, DEFAULT_POOL_NAME);
        assert_eq!(s.pool_size, 5);
        assert_eq!(s.response_timeout, Duration::from_secs(10));
        assert_eq!(s.socket_size, 4096);
        assert_eq!(s.referral_hop_limit, 15);
    }

    #[test]
    fn send_on_closed_socket() {
        let server = Server::new("ldap://localhost").unwrap();
        let pool = Arc::new(ServerPool::single(server.clone()));
        let mut state = ConnState::new(pool, server, LdapConnSettings::new());
        let err = state
            .write_message(1, &Request::Unbind, None)
            .unwrap_err();
        assert!(matches!(err, LdapError::SocketNotOpen(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn usage_counts_referrals() {
        let mut usage = Usage::default();
        usage.received(ResponseType::SearchResRef, 10);
        usage.received(ResponseType::SearchResDone, 14);
        assert_eq!(usage.bytes_received, 24);
        assert_eq!(usage.referrals_received, 1);
    }
}
