use std::thread;

use super::{reestablish, sync};
use crate::conn::ConnState;
use crate::protocol::MaybeControls;
use crate::request::Request;
use crate::result::{LdapError, Response, Result, RetryRecord};
use crate::RequestId;

/// Synchronous strategy which survives transport failures.
///
/// A recoverable failure starts the restart loop: sleep, reconnect through
/// the server pool, restore TLS and the last bind, then repeat the failed
/// step. With a bounded number of tries every failure is recorded, and the
/// record is handed over in `LdapError::MaxRetries` when the budget runs out.
/// The record is cleared by every successful operation.
pub(crate) struct Restartable {
    history: Vec<RetryRecord>,
}

impl Restartable {
    pub fn new() -> Restartable {
        Restartable { history: vec![] }
    }

    pub fn history(&self) -> &[RetryRecord] {
        &self.history
    }

    pub fn open(&mut self, state: &mut ConnState) -> Result<()> {
        match sync::open(state) {
            Ok(()) => {
                self.history.clear();
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                let should_tls = state.settings.starttls;
                self.restart(state, e, false, should_tls, |_| Ok(()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn send(
        &mut self,
        state: &mut ConnState,
        req: Request,
        controls: MaybeControls,
    ) -> Result<RequestId> {
        let should_bind = state.last_bind.is_some() && !matches!(req, Request::Bind { .. });
        let should_tls = state.tls_started || state.settings.starttls;
        match sync::send(state, req.clone(), controls.clone()) {
            Ok(id) => Ok(id),
            Err(e) if e.is_recoverable() => self.restart(state, e, should_bind, should_tls, |s| {
                sync::send(s, req.clone(), controls.clone())
            }),
            Err(e) => Err(e),
        }
    }

    /// Receive the response to `id`. If receiving fails, the request is sent
    /// again on a new session and the whole exchange repeated.
    pub fn post_send(&mut self, state: &mut ConnState, id: RequestId) -> Result<Response> {
        let should_tls = state.tls_started || state.settings.starttls;
        match sync::exchange(state, id) {
            Ok(resp) => {
                self.history.clear();
                Ok(resp)
            }
            Err(e) if e.is_recoverable() => {
                let env = match state.outstanding.remove(&id) {
                    Some(env) => env,
                    None => return Err(e),
                };
                let should_bind =
                    state.last_bind.is_some() && !matches!(env.request, Request::Bind { .. });
                self.restart(state, e, should_bind, should_tls, |s| {
                    let id = sync::send(s, env.request.clone(), env.controls.clone())?;
                    sync::exchange(s, id)
                })
            }
            Err(e) => Err(e),
        }
    }

    fn record(&mut self, state: &mut ConnState, e: &LdapError) {
        if state.settings.restart_tries.is_some() {
            self.history.push(RetryRecord::from_error(e));
        }
        if state.settings.collect_usage {
            state.usage.restartable_failures += 1;
        }
    }

    fn restart<T>(
        &mut self,
        state: &mut ConnState,
        first: LdapError,
        should_bind: bool,
        should_tls: bool,
        mut op: impl FnMut(&mut ConnState) -> Result<T>,
    ) -> Result<T> {
        warn!("connection to {} failed: {}", state.server.url(), first);
        self.record(state, &first);
        let tries = state.settings.restart_tries;
        let mut remaining = tries;
        let mut attempt = 0u32;
        loop {
            match remaining {
                Some(0) => {
                    let history = std::mem::take(&mut self.history);
                    return Err(LdapError::MaxRetries {
                        message: "restartable connection strategy failed".into(),
                        history,
                        tries,
                    });
                }
                Some(ref mut n) => *n -= 1,
                None => (),
            }
            thread::sleep(state.settings.restart_sleep);
            attempt += 1;
            debug!("restarting connection, attempt {}", attempt);
            match reestablish(state, should_bind, should_tls).and_then(|_| op(state)) {
                Ok(v) => {
                    self.history.clear();
                    if state.settings.collect_usage {
                        state.usage.restartable_successes += 1;
                    }
                    return Ok(v);
                }
                Err(e) if e.is_recoverable() => {
                    warn!("restart attempt failed: {}", e);
                    state.set_error(&e);
                    self.record(state, &e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
