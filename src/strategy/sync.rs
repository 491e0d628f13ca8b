use std::collections::HashMap;

use super::finalize;
use crate::conn::ConnState;
use crate::exop::{Exop, StartTLS};
use crate::filter::parse as parse_filter;
use crate::protocol::{
    compute_message_length, LdapMessage, MaybeControls, NOTICE_OF_DISCONNECTION_OID,
    TRANSACTION_ERROR_OID,
};
use crate::request::{Envelope, Request, SearchRequest};
use crate::result::{LdapError, LdapResultExt, Response, Result};
use crate::search::{DerefAliases, ResultEntry, Scope, SearchEntry};
use crate::server::{DsaInfo, Scheme};
use crate::RequestId;

use tokio_util::codec::Decoder;

/// Connect the socket, then run StartTLS and read the server information
/// if the settings ask for them.
pub(crate) fn open(state: &mut ConnState) -> Result<()> {
    state.open_socket()?;
    if state.settings.starttls && state.server.scheme() == Scheme::Ldap && !state.tls_started {
        start_tls(state)?;
    }
    if state.settings.read_server_info {
        read_server_info(state)?;
    }
    Ok(())
}

pub(crate) fn start_tls(state: &mut ConnState) -> Result<()> {
    let id = send(state, Request::Extended(Exop::from(StartTLS)), None)?;
    exchange(state, id)?.success()?;
    state.wrap_tls()
}

/// Read the root DSE into the cached server information.
///
/// An unsuccessful result clears the cache instead of failing.
fn read_server_info(state: &mut ConnState) -> Result<()> {
    let req = Request::Search(SearchRequest {
        base: String::new(),
        scope: Scope::Base,
        deref: DerefAliases::Never,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter: parse_filter("(objectClass=*)")?,
        attrs: vec!["*".to_owned(), "+".to_owned()],
    });
    let id = send(state, req, None)?;
    let resp = match exchange(state, id)?.success() {
        Ok(resp) => resp,
        Err(e) => {
            debug!("server info not read: {}", e);
            state.server.set_info(None);
            return Ok(());
        }
    };
    let info = resp
        .entries
        .into_iter()
        .find(|e| !e.is_ref() && !e.is_intermediate())
        .map(SearchEntry::construct)
        .transpose()?
        .map(|entry| DsaInfo::from_attrs(entry.attrs))
        .or_else(|| Some(DsaInfo::from_attrs(HashMap::new())));
    state.server.set_info(info);
    Ok(())
}

/// Write a request with a fresh message id and record it as outstanding.
pub(crate) fn send(state: &mut ConnState, req: Request, controls: MaybeControls) -> Result<RequestId> {
    let id = state.server.next_message_id();
    state.write_message(id, &req, controls.clone())?;
    match req {
        Request::Abandon(target) => {
            if state.outstanding.remove(&target).is_some() {
                state.abandoned.insert(target);
            }
        }
        Request::Unbind => (),
        request => {
            state.outstanding.insert(id, Envelope { request, controls });
        }
    }
    Ok(id)
}

/// Receive the response to `id` and finalize it.
pub(crate) fn exchange(state: &mut ConnState, id: RequestId) -> Result<Response> {
    let resp = receive(state, id)?;
    finalize(state, id, resp)
}

fn next_message(state: &mut ConnState) -> Result<LdapMessage> {
    loop {
        let len = compute_message_length(&state.buffer)?;
        if let Some(len) = len {
            let msg = state
                .codec
                .decode(&mut state.buffer)?
                .ok_or_else(|| LdapError::SocketReceive("incomplete message".into()))?;
            if state.settings.collect_usage {
                state.usage.received(msg.rtype()?, len);
            }
            return Ok(msg);
        }
        state.read_chunk()?;
    }
}

/// Blocking receive loop for one request.
///
/// Entries, references and intermediate responses are gathered until the
/// final message for `id` arrives.
pub(crate) fn receive(state: &mut ConnState, id: RequestId) -> Result<Response> {
    let mut entries = vec![];
    loop {
        let msg = match next_message(state) {
            Ok(msg) => msg,
            Err(e) => {
                state.set_error(&e);
                return Err(e);
            }
        };
        if msg.id == id {
            let rtype = msg.rtype()?;
            if rtype.is_partial() {
                entries.push(ResultEntry(msg.op, msg.controls));
                continue;
            }
            let LdapResultExt(mut result, exop, sasl_creds) = LdapResultExt::try_from(msg.op)?;
            result.ctrls = msg.controls;
            return Ok(Response {
                entries,
                result,
                exop,
                sasl_creds,
                ldif: None,
            });
        }
        if msg.id == 0 {
            let LdapResultExt(result, exop, _) = LdapResultExt::try_from(msg.op)?;
            let e = match exop.name.as_deref() {
                Some(NOTICE_OF_DISCONNECTION_OID) => {
                    warn!("notice of disconnection from {}: {}", state.server.url(), result);
                    state.close_socket();
                    LdapError::SessionTerminated
                }
                Some(TRANSACTION_ERROR_OID) => LdapError::SocketReceive(format!(
                    "transaction error from server: {}",
                    result.text
                )),
                _ => {
                    warn!("dropping unsolicited notification {:?}", exop.name);
                    LdapError::SocketReceive("unknown unsolicited notification from server".into())
                }
            };
            state.set_error(&e);
            return Err(e);
        }
        if state.abandoned.contains(&msg.id) {
            if !msg.rtype()?.is_partial() {
                state.abandoned.remove(&msg.id);
            }
            debug!("discarding response to abandoned id {}", msg.id);
            continue;
        }
        warn!("unexpected message id {} while waiting for {}", msg.id, id);
        let e = LdapError::SocketReceive("invalid messageId received".into());
        state.set_error(&e);
        return Err(e);
    }
}
