//! Connection strategies.
//!
//! Every [`LdapConn`](crate::LdapConn) drives exactly one strategy, chosen by
//! [`ClientStrategy`](crate::ClientStrategy) when the connection is created. The
//! strategy decides how a request reaches the directory and how its response comes
//! back: over one blocking socket, over a socket which is transparently reopened
//! after transport failures, through a pool of worker connections, into LDIF text,
//! or against an in-memory directory.
//!
//! The pool types of the reusable strategy are public, so that pools can be shared
//! and inspected through a [`PoolRegistry`](struct.PoolRegistry.html).

use crate::conn::{ClientStrategy, ConnState, LdapConnSettings};
use crate::ldap::LdapConn;
use crate::protocol::MaybeControls;
use crate::request::{Envelope, Request};
use crate::result::{LdapError, Response, Result, RetryRecord};
use crate::search::{parse_refs, ResultEntry};
use crate::server::Server;
use crate::util::get_url_params;
use crate::RequestId;

use url::Url;

mod ldif;
mod mock;
mod restartable;
mod reusable;
mod sync;

pub(crate) use self::ldif::Ldif;
pub(crate) use self::mock::MockStrategy;
pub(crate) use self::restartable::Restartable;
pub use self::reusable::{ConnectionPool, PoolRegistry, WorkerState};
pub(crate) use self::reusable::Reusable;

pub(crate) enum Strategy {
    Sync,
    Restartable(Restartable),
    Reusable(Reusable),
    Ldif(Ldif),
    MockSync(MockStrategy),
    MockAsync(MockStrategy),
}

impl Strategy {
    pub fn new(kind: ClientStrategy, state: &ConnState) -> Result<Strategy> {
        Ok(match kind {
            ClientStrategy::Sync => Strategy::Sync,
            ClientStrategy::Restartable => Strategy::Restartable(Restartable::new()),
            ClientStrategy::Reusable => Strategy::Reusable(Reusable::new(state)?),
            ClientStrategy::Ldif => Strategy::Ldif(Ldif::new()),
            ClientStrategy::MockSync => Strategy::MockSync(MockStrategy::new(&state.server)),
            ClientStrategy::MockAsync => Strategy::MockAsync(MockStrategy::new(&state.server)),
        })
    }

    pub fn kind(&self) -> ClientStrategy {
        match self {
            Strategy::Sync => ClientStrategy::Sync,
            Strategy::Restartable(_) => ClientStrategy::Restartable,
            Strategy::Reusable(_) => ClientStrategy::Reusable,
            Strategy::Ldif(_) => ClientStrategy::Ldif,
            Strategy::MockSync(_) => ClientStrategy::MockSync,
            Strategy::MockAsync(_) => ClientStrategy::MockAsync,
        }
    }

    /// True if the result of an operation is collected right after sending it.
    pub fn is_sync(&self) -> bool {
        !matches!(self, Strategy::Reusable(_) | Strategy::MockAsync(_))
    }

    pub fn open(&mut self, state: &mut ConnState) -> Result<()> {
        match self {
            Strategy::Sync => sync::open(state),
            Strategy::Restartable(r) => r.open(state),
            Strategy::Reusable(r) => r.open(state),
            Strategy::Ldif(_) | Strategy::MockSync(_) | Strategy::MockAsync(_) => {
                state.open_virtual();
                Ok(())
            }
        }
    }

    /// Release the transport. Never fails.
    pub fn close(&mut self, state: &mut ConnState) {
        match self {
            Strategy::Reusable(r) => r.close(state),
            _ => state.close_socket(),
        }
        debug!("connection to {} closed", state.server.url());
    }

    pub fn send(
        &mut self,
        state: &mut ConnState,
        req: Request,
        controls: MaybeControls,
    ) -> Result<RequestId> {
        match self {
            Strategy::Sync => sync::send(state, req, controls),
            Strategy::Restartable(r) => r.send(state, req, controls),
            Strategy::Reusable(r) => r.send(state, req, controls),
            Strategy::Ldif(l) => l.send(state, req, controls),
            Strategy::MockSync(m) | Strategy::MockAsync(m) => m.send(state, req, controls),
        }
    }

    /// Collect the response to a single-result operation.
    pub fn post_send_single_response(
        &mut self,
        state: &mut ConnState,
        id: RequestId,
    ) -> Result<Response> {
        self.post_send(state, id)
    }

    /// Collect the entries, references and final result of a search.
    pub fn post_send_search(&mut self, state: &mut ConnState, id: RequestId) -> Result<Response> {
        self.post_send(state, id)
    }

    fn post_send(&mut self, state: &mut ConnState, id: RequestId) -> Result<Response> {
        match self {
            Strategy::Sync => sync::exchange(state, id),
            Strategy::Restartable(r) => r.post_send(state, id),
            Strategy::Reusable(r) => r
                .get_response(state, id)?
                .ok_or(LdapError::NotOutstanding(id)),
            Strategy::Ldif(l) => l.take(id),
            Strategy::MockSync(m) | Strategy::MockAsync(m) => m.take(state, id),
        }
    }

    /// Response to the request sent with the given id.
    ///
    /// `Ok(None)` is returned for requests which have no response.
    pub fn get_response(
        &mut self,
        state: &mut ConnState,
        id: RequestId,
    ) -> Result<Option<Response>> {
        match self {
            Strategy::Reusable(r) => r.get_response(state, id),
            Strategy::Ldif(l) => l.take(id).map(Some),
            Strategy::MockSync(m) | Strategy::MockAsync(m) => m.take(state, id).map(Some),
            Strategy::Sync | Strategy::Restartable(_) => {
                let is_search = match state.outstanding.get(&id) {
                    Some(env) => env.request.is_search(),
                    None => return Err(LdapError::NotOutstanding(id)),
                };
                let resp = if is_search {
                    self.post_send_search(state, id)?
                } else {
                    self.post_send_single_response(state, id)?
                };
                Ok(Some(resp))
            }
        }
    }

    /// Failures recorded by a restartable connection since its last success.
    pub fn retry_history(&self) -> &[RetryRecord] {
        match self {
            Strategy::Restartable(r) => r.history(),
            _ => &[],
        }
    }

    pub fn pool(&self) -> Option<&std::sync::Arc<ConnectionPool>> {
        match self {
            Strategy::Reusable(r) => Some(r.pool()),
            _ => None,
        }
    }
}

/// Reopen the session of a connection: close whatever is left of the
/// socket, take a server from the pool and connect, then restore TLS and
/// the last bind if asked to. Requests of the old session are forgotten.
pub(crate) fn reestablish(
    state: &mut ConnState,
    should_bind: bool,
    should_tls: bool,
) -> Result<()> {
    state.close_socket();
    state.outstanding.clear();
    state.abandoned.clear();
    sync::open(state)?;
    if should_tls && !state.tls_started {
        sync::start_tls(state)?;
    }
    if should_bind {
        if let Some(bind) = state.last_bind.clone() {
            debug!("replaying bind on {}", state.server.url());
            let id = sync::send(state, bind.request, bind.controls)?;
            sync::exchange(state, id)?.success()?;
        }
    }
    Ok(())
}

/// Bookkeeping shared by every strategy once the final response to a
/// request is known: the request leaves the outstanding table, referrals
/// are chased if enabled, and a successful bind is remembered.
pub(crate) fn finalize(
    state: &mut ConnState,
    id: RequestId,
    mut resp: Response,
) -> Result<Response> {
    let env = match state.outstanding.remove(&id) {
        Some(env) => env,
        None => return Ok(resp),
    };
    if resp.result.rc == 10 && state.settings.collect_usage {
        state.usage.referrals_received += 1;
    }
    if state.settings.auto_referrals {
        if resp.result.rc == 10 && !resp.result.refs.is_empty() {
            resp = follow_referral(state, &env, resp)?;
        }
        if env.request.is_search() && resp.entries.iter().any(ResultEntry::is_ref) {
            resp = follow_continuations(state, &env, resp)?;
        }
    }
    if let Request::Bind { .. } = env.request {
        if resp.result.rc == 0 {
            state.bound = true;
            state.last_bind = Some(env);
        }
    }
    Ok(resp)
}

fn allowed_host(settings: &LdapConnSettings, host: &str) -> Option<bool> {
    settings
        .allowed_referral_hosts
        .iter()
        .find(|(h, _)| h == "*" || h.eq_ignore_ascii_case(host))
        .map(|(_, may_bind)| *may_bind)
}

fn follow_referral(state: &mut ConnState, env: &Envelope, resp: Response) -> Result<Response> {
    for url in resp.result.refs.clone() {
        match chase(state, env, &url, false) {
            Ok(Some(chased)) => return Ok(chased),
            Ok(None) => continue,
            Err(LdapError::ReferralHopLimit) => return Err(LdapError::ReferralHopLimit),
            Err(e) => warn!("referral {} not followed: {}", url, e),
        }
    }
    Ok(resp)
}

fn follow_continuations(
    state: &mut ConnState,
    env: &Envelope,
    mut resp: Response,
) -> Result<Response> {
    let mut entries = Vec::with_capacity(resp.entries.len());
    for entry in std::mem::take(&mut resp.entries) {
        if !entry.is_ref() {
            entries.push(entry);
            continue;
        }
        let urls = parse_refs(entry.0.clone())?;
        let mut followed = false;
        for url in urls {
            match chase(state, env, &url, true) {
                Ok(Some(chased)) => {
                    entries.extend(chased.entries);
                    followed = true;
                    break;
                }
                Ok(None) => continue,
                Err(LdapError::ReferralHopLimit) => return Err(LdapError::ReferralHopLimit),
                Err(e) => warn!("continuation reference {} not followed: {}", url, e),
            }
        }
        if !followed {
            entries.push(entry);
        }
    }
    resp.entries = entries;
    Ok(resp)
}

/// Repeat a request against the server named in a referral URL.
///
/// Returns `Ok(None)` if the host isn't allowed.
fn chase(
    state: &mut ConnState,
    env: &Envelope,
    url: &str,
    continuation: bool,
) -> Result<Option<Response>> {
    if state.referral_depth >= state.settings.referral_hop_limit {
        return Err(LdapError::ReferralHopLimit);
    }
    let url = Url::parse(url)?;
    let may_bind = match allowed_host(&state.settings, url.host_str().unwrap_or("")) {
        Some(may_bind) => may_bind,
        None => {
            debug!("referral host of {} not allowed", url);
            return Ok(None);
        }
    };
    let mut params = get_url_params(&url)?;
    if continuation {
        params.scope = None;
        params.filter = None;
    }
    let request = env.request.for_referral(&params)?;
    let mut settings = state.settings.clone();
    settings.strategy = ClientStrategy::Sync;
    settings.raise_errors = false;
    settings.read_server_info = false;
    settings.pool_registry = None;
    let mut child = LdapConn::from_server(Server::from_url(&url)?, settings)?;
    child.state.referral_depth = state.referral_depth + 1;
    debug!("following referral to {}, depth {}", url, child.state.referral_depth);
    child.open()?;
    if may_bind {
        if let Some(bind) = state.last_bind.clone() {
            child.perform_with(bind.request, bind.controls)?.success()?;
        }
    }
    let resp = child.perform_with(request, env.controls.clone());
    child.close();
    let resp = resp?;
    if state.settings.collect_usage {
        state.usage.referrals_followed += 1;
    }
    Ok(Some(resp))
}
