use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::conn::{ClientStrategy, ConnState, LdapConnSettings, Usage};
use crate::controls_impl::IntoRawControlVec;
use crate::exop::{Exop, StartTLS, WhoAmI, WhoAmIResp};
use crate::protocol::MaybeControls;
use crate::request::{Mod, Request};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, Response, Result, RetryRecord, SearchResult,
};
use crate::search::{Scope, SearchOptions};
use crate::server::{Server, ServerPool};
use crate::strategy::{ConnectionPool, Strategy};
use crate::RequestId;

/// Connection to an LDAP server.
///
/// A connection drives one [`ClientStrategy`](enum.ClientStrategy.html), chosen in
/// the settings when the connection is created. All operation methods are
/// synchronous regardless of the strategy: with the asynchronous strategies
/// (`Reusable` and `MockAsync`), the methods send the request and immediately
/// collect its response through [`get_response()`](#method.get_response). Callers
/// who want to overlap operations can use [`send()`](#method.send) and
/// `get_response()` directly.
///
/// A connection is opened automatically by the first operation, if it wasn't opened
/// explicitly. The result and complete response of the last operation are kept, and
/// can be inspected with [`result()`](#method.result) and [`response()`](#method.response).
///
/// If the settings ask for it with
/// [`set_raise_errors()`](struct.LdapConnSettings.html#method.set_raise_errors), an
/// unsuccessful result is returned as `LdapError::LdapResult`.
pub struct LdapConn {
    pub(crate) state: ConnState,
    strategy: Strategy,
    controls: MaybeControls,
    search_opts: Option<SearchOptions>,
    result: Option<LdapResult>,
    response: Option<Response>,
}

impl fmt::Debug for LdapConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LdapConn")
            .field("server", &self.state.server)
            .field("strategy", &self.strategy.kind())
            .field("closed", &self.state.closed)
            .field("bound", &self.state.bound)
            .finish()
    }
}

impl LdapConn {
    /// Open a connection to an LDAP server specified by `url`.
    ///
    /// The `ldap`, `ldaps` and `ldapi` schemes are supported. For `ldapi`, the
    /// host part is the percent-encoded path of the Unix domain socket.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_settings(LdapConnSettings::new(), url)
    }

    /// Open a connection to an LDAP server specified by `url`, using
    /// `settings` to specify additional parameters.
    pub fn with_settings(settings: LdapConnSettings, url: &str) -> Result<Self> {
        let mut conn = Self::from_server(Server::new(url)?, settings)?;
        conn.open()?;
        Ok(conn)
    }

    /// Create a closed connection to `server`. It will be opened by the first operation,
    /// or by calling [`open()`](#method.open).
    pub fn from_server(server: Server, settings: LdapConnSettings) -> Result<Self> {
        Self::from_shared_pool(Arc::new(ServerPool::single(server)), settings)
    }

    /// Create a closed connection which takes its server from `pool` whenever it
    /// connects.
    pub fn from_pool(pool: ServerPool, settings: LdapConnSettings) -> Result<Self> {
        Self::from_shared_pool(Arc::new(pool), settings)
    }

    pub(crate) fn from_shared_pool(pool: Arc<ServerPool>, settings: LdapConnSettings) -> Result<Self> {
        let server = pool
            .servers()
            .first()
            .cloned()
            .ok_or_else(|| LdapError::Configuration("empty server pool".into()))?;
        let kind = settings.strategy;
        let state = ConnState::new(pool, server, settings);
        let strategy = Strategy::new(kind, &state)?;
        Ok(LdapConn {
            state,
            strategy,
            controls: None,
            search_opts: None,
            result: None,
            response: None,
        })
    }

    /// Open the connection, if it's closed.
    pub fn open(&mut self) -> Result<()> {
        if !self.state.closed {
            return Ok(());
        }
        debug!(
            "opening {:?} connection to {}",
            self.strategy.kind(),
            self.state.server.url()
        );
        let res = self.strategy.open(&mut self.state);
        if let Err(ref e) = res {
            self.state.set_error(e);
        }
        res
    }

    /// Close the connection, sending an Unbind first if it's open. Errors
    /// are ignored.
    pub fn close(&mut self) {
        if !self.state.closed {
            let res = match self.strategy {
                Strategy::Sync | Strategy::Restartable(_) => {
                    let id = self.state.server.next_message_id();
                    self.state.write_message(id, &Request::Unbind, None)
                }
                _ => self
                    .strategy
                    .send(&mut self.state, Request::Unbind, None)
                    .map(|_| ()),
            };
            if let Err(e) = res {
                debug!("unbind on close failed: {}", e);
            }
        }
        self.strategy.close(&mut self.state);
    }

    /// Send an Unbind and close the connection.
    pub fn unbind(&mut self) -> Result<()> {
        let res = if self.state.closed {
            Ok(())
        } else {
            self.strategy
                .send(&mut self.state, Request::Unbind, None)
                .map(|_| ())
        };
        self.strategy.close(&mut self.state);
        res
    }

    /// Use the provided `SearchOptions` with the next Search operation. If this method
    /// is used in combination with a non-Search operation, the provided options will
    /// be silently discarded when the operation is invoked.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    /// Pass the provided request control(s) to the next LDAP operation.
    /// Controls can be constructed by instantiating structs in the
    /// [`controls`](controls/index.html) module, and converted to the form needed
    /// by this method by calling `into()` on the instances.
    ///
    /// This method accepts either a control vector or a single `RawControl`.
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into());
        self
    }

    fn perform(&mut self, req: Request) -> Result<Response> {
        let controls = self.controls.take();
        self.perform_with(req, controls)
    }

    /// Send a request and collect its response with the strategy of the
    /// connection, opening it first if needed.
    pub(crate) fn perform_with(&mut self, req: Request, controls: MaybeControls) -> Result<Response> {
        if self.state.settings.read_only && req.is_write() {
            return Err(LdapError::ReadOnly);
        }
        if self.state.closed {
            self.open()?;
        }
        match self.exchange(req, controls) {
            Ok(resp) => self.store(resp),
            Err(e) => {
                self.state.set_error(&e);
                Err(e)
            }
        }
    }

    fn exchange(&mut self, req: Request, controls: MaybeControls) -> Result<Response> {
        let is_search = req.is_search();
        let id = self.strategy.send(&mut self.state, req, controls)?;
        if !self.strategy.is_sync() {
            return self
                .strategy
                .get_response(&mut self.state, id)?
                .ok_or(LdapError::NotOutstanding(id));
        }
        if is_search {
            self.strategy.post_send_search(&mut self.state, id)
        } else {
            self.strategy.post_send_single_response(&mut self.state, id)
        }
    }

    fn store(&mut self, resp: Response) -> Result<Response> {
        self.result = Some(resp.result.clone());
        self.response = Some(resp.clone());
        if self.state.settings.raise_errors && !resp.result.never_raised() {
            let e = LdapError::from(resp.result);
            self.state.set_error(&e);
            return Err(e);
        }
        Ok(resp)
    }

    /// Send a request without waiting for its response, returning the id with which
    /// the response is collected by [`get_response()`](#method.get_response).
    ///
    /// The connection must be open. Controls set with
    /// [`with_controls()`](#method.with_controls) are attached to the request.
    pub fn send(&mut self, req: Request) -> Result<RequestId> {
        if self.state.settings.read_only && req.is_write() {
            return Err(LdapError::ReadOnly);
        }
        let controls = self.controls.take();
        self.strategy
            .send(&mut self.state, req, controls)
            .map_err(|e| {
                self.state.set_error(&e);
                e
            })
    }

    /// Collect the response to a request sent with [`send()`](#method.send).
    ///
    /// Returns `Ok(None)` for requests which have no response, like Unbind with the
    /// `Reusable` strategy.
    pub fn get_response(&mut self, id: RequestId) -> Result<Option<Response>> {
        match self.strategy.get_response(&mut self.state, id) {
            Ok(Some(resp)) => self.store(resp).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                self.state.set_error(&e);
                Err(e)
            }
        }
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password (`bind_pw`).
    pub fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<Response> {
        debug!("simple bind as {:?}", bind_dn);
        self.perform(Request::simple_bind(bind_dn, bind_pw))
    }

    /// Do an SASL Bind with the given mechanism and credentials. Only one round
    /// is performed; if the result is `saslBindInProgress`, the server's credentials
    /// are in the `sasl_creds` field of the response.
    pub fn sasl_bind(&mut self, mechanism: &str, credentials: Option<&[u8]>) -> Result<Response> {
        debug!("SASL bind, mechanism {}", mechanism);
        self.perform(Request::sasl_bind(mechanism, credentials))
    }

    /// Do an SASL EXTERNAL bind on the connection. The identity of the client
    /// must have already been established by connection-specific methods, as
    /// is the case for Unix domain sockets or TLS client certificates. The bind
    /// is made with the hardcoded empty authzId value.
    pub fn sasl_external_bind(&mut self) -> Result<Response> {
        self.sasl_bind("EXTERNAL", Some(b""))
    }

    /// Perform a Search with the given base DN (`base`), scope, filter, and
    /// the list of attributes to be returned (`attrs`). If `attrs` is empty,
    /// or if it contains a special name `*` (asterisk), return all (user) attributes.
    /// Requesting a special name `+` (plus sign) will return all operational
    /// attributes. Include both `*` and `+` in order to return all attributes
    /// of an entry.
    ///
    /// The returned structure wraps the vector of result entries and the overall
    /// result of the operation. Entries are not directly usable, and must be parsed by
    /// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct).
    pub fn search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchResult> {
        let opts = self.search_opts.take().unwrap_or_else(SearchOptions::new);
        let req = Request::search(base, scope, filter, attrs.as_ref(), opts)?;
        self.perform(req).map(SearchResult::from)
    }

    /// Add an entry named by `dn`, with the list of attributes and their values
    /// given in `attrs`. None of the `HashSet`s of values for an attribute may
    /// be empty.
    pub fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<Response> {
        let req = Request::add(dn, attrs)?;
        self.perform(req)
    }

    /// Delete an entry named by `dn`.
    pub fn delete(&mut self, dn: &str) -> Result<Response> {
        self.perform(Request::Delete { dn: dn.to_owned() })
    }

    /// Modify an entry named by `dn` by sequentially applying the modifications given by `mods`.
    /// See the [`Mod`](enum.Mod.html) documentation for the description of possible values.
    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<Response> {
        let req = Request::modify(dn, mods)?;
        self.perform(req)
    }

    /// Rename and/or move an entry named by `dn`. The new name is given by `rdn`. If
    /// `delete_old` is `true`, delete the previous value of the naming attribute from
    /// the entry. If the entry is to be moved elsewhere in the DIT, `new_sup` gives
    /// the new superior entry where the moved entry will be anchored.
    pub fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<Response> {
        self.perform(Request::ModifyDn {
            dn: dn.to_owned(),
            new_rdn: rdn.to_owned(),
            delete_old,
            new_superior: new_sup.map(str::to_owned),
        })
    }

    /// Compare the value(s) of the attribute `attr` within an entry named by `dn` with the
    /// value `val`. If any of the values is identical to the provided one, return result code 6
    /// (`compareTrue`), otherwise return result code 5 (`compareFalse`).
    pub fn compare<B: AsRef<[u8]>>(&mut self, dn: &str, attr: &str, val: B) -> Result<CompareResult> {
        self.perform(Request::Compare {
            dn: dn.to_owned(),
            attr: attr.to_owned(),
            value: val.as_ref().to_vec(),
        })
        .map(|resp| CompareResult(resp.result))
    }

    /// Perform an Extended operation given by `exop`. Extended operations are defined in the
    /// [`exop`](exop/index.html) module.
    pub fn extended<E: Into<Exop>>(&mut self, exop: E) -> Result<ExopResult> {
        let req = Request::extended(exop.into())?;
        self.perform(req).map(|resp| ExopResult(resp.exop, resp.result))
    }

    /// Upgrade the connection with the StartTLS extended operation.
    ///
    /// Strategies without a socket of their own only record the request.
    pub fn start_tls(&mut self) -> Result<()> {
        if self.state.tls_started {
            return Ok(());
        }
        self.extended(StartTLS)?.success()?;
        if self.state.stream.is_some() && !self.state.tls_started {
            self.state.wrap_tls()?;
        }
        Ok(())
    }

    /// Authorization identity of the connection, by the Who Am I? operation.
    /// Returns `None` for an anonymous connection.
    pub fn who_am_i(&mut self) -> Result<Option<String>> {
        let (exop, _) = self.extended(WhoAmI)?.success()?;
        let resp: WhoAmIResp = exop.parse()?;
        Ok(if resp.authzid.is_empty() {
            None
        } else {
            Some(resp.authzid)
        })
    }

    /// Ask the server to abandon an operation identified by `msgid`.
    pub fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.send(Request::Abandon(msgid)).map(|_| ())
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    pub fn is_bound(&self) -> bool {
        self.state.bound
    }

    pub fn tls_started(&self) -> bool {
        self.state.tls_started
    }

    pub fn strategy(&self) -> ClientStrategy {
        self.strategy.kind()
    }

    /// Message of the last error on the connection.
    pub fn last_error(&self) -> Option<&str> {
        self.state.last_error.as_deref()
    }

    /// Usage counters, if collection is enabled in the settings.
    pub fn usage(&self) -> Option<&Usage> {
        if self.state.settings.collect_usage {
            Some(&self.state.usage)
        } else {
            None
        }
    }

    /// Result of the last operation.
    pub fn result(&self) -> Option<&LdapResult> {
        self.result.as_ref()
    }

    /// Complete response of the last operation.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Failed attempts recorded by a restartable connection since its last success.
    pub fn retry_history(&self) -> &[RetryRecord] {
        self.strategy.retry_history()
    }

    /// Server the connection is, or was last, connected to.
    pub fn server(&self) -> &Server {
        &self.state.server
    }

    /// Worker pool of a reusable connection.
    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.strategy.pool()
    }
}

impl Drop for LdapConn {
    fn drop(&mut self) {
        if !self.state.closed {
            self.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dit::Dit;

    fn mock_conn(strategy: ClientStrategy) -> LdapConn {
        let mut dit = Dit::new();
        dit.add_entry("dc=example", vec![("dc", vec!["example"])]).unwrap();
        dit.add_entry(
            "cn=admin,dc=example",
            vec![("userPassword", vec!["secret"])],
        )
        .unwrap();
        let server = Server::mock("test", dit);
        LdapConn::from_server(server, LdapConnSettings::new().set_strategy(strategy)).unwrap()
    }

    #[test]
    fn auto_open_and_result() {
        let mut conn = mock_conn(ClientStrategy::MockSync);
        assert!(conn.is_closed());
        conn.simple_bind("cn=admin,dc=example", "secret")
            .unwrap()
            .success()
            .unwrap();
        assert!(!conn.is_closed());
        assert!(conn.is_bound());
        assert_eq!(conn.result().unwrap().rc, 0);
        assert_eq!(conn.who_am_i().unwrap().as_deref(), Some("dn:cn=admin,dc=example"));
        conn.unbind().unwrap();
        assert!(conn.is_closed());
        assert!(!conn.is_bound());
    }

    #[test]
    fn read_only_rejects_writes() {
        let server = Server::mock("ro", Dit::new());
        let settings = LdapConnSettings::new()
            .set_strategy(ClientStrategy::MockSync)
            .set_read_only(true);
        let mut conn = LdapConn::from_server(server, settings).unwrap();
        let err = conn.delete("cn=x").unwrap_err();
        assert!(matches!(err, LdapError::ReadOnly));
        assert!(conn.result().is_none());
    }

    #[test]
    fn raise_errors() {
        let server = Server::mock("raise", Dit::new());
        let settings = LdapConnSettings::new()
            .set_strategy(ClientStrategy::MockAsync)
            .set_raise_errors(true);
        let mut conn = LdapConn::from_server(server, settings).unwrap();
        let err = conn.delete("cn=missing").unwrap_err();
        match err {
            LdapError::LdapResult { result } => assert_eq!(result.rc, 32),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(conn.result().unwrap().rc, 32);
        assert!(conn.last_error().is_some());
    }

    #[test]
    fn two_phase_interface() {
        let mut conn = mock_conn(ClientStrategy::MockAsync);
        conn.open().unwrap();
        let req = Request::search("dc=example", Scope::Subtree, "(objectClass=*)", &["*"], SearchOptions::new())
            .unwrap();
        let id = conn.send(req).unwrap();
        let resp = conn.get_response(id).unwrap().unwrap();
        assert_eq!(resp.result.rc, 0);
        assert!(matches!(
            conn.get_response(id),
            Err(LdapError::NotOutstanding(_))
        ));
    }
}
