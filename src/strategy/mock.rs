use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::finalize;
use crate::controls::{Control, PagedResults, RawControl, PAGED_RESULTS_OID};
use crate::conn::ConnState;
use crate::dit::{Dit, DitError, Entry};
use crate::exop::{Exop, STARTTLS_OID, WHOAMI_OID};
use crate::protocol::MaybeControls;
use crate::request::{BindAuth, Envelope, Request, SearchRequest};
use crate::result::{LdapError, LdapResult, Response, ResponseType, Result};
use crate::search::{entry_tag, ResultEntry};
use crate::server::Server;
use crate::RequestId;

/// Strategy answering requests from the in-memory directory of its server.
///
/// The response is computed when the request is sent, and handed out by
/// `take()`. The sync and async mock variants differ only in when the connection
/// collects it.
pub(crate) struct MockStrategy {
    dit: Arc<RwLock<Dit>>,
    bound_dn: String,
    pending: HashMap<RequestId, Response>,
}

fn result(rtype: ResponseType, rc: u32, text: impl Into<String>) -> Response {
    Response::from_result(LdapResult::new(rtype, rc, text))
}

fn dit_result(rtype: ResponseType, res: std::result::Result<(), DitError>) -> Response {
    match res {
        Ok(()) => result(rtype, 0, ""),
        Err(e) => result(rtype, e.rc(), e.to_string()),
    }
}

impl MockStrategy {
    pub fn new(server: &Server) -> MockStrategy {
        MockStrategy {
            dit: server.dit(),
            bound_dn: String::new(),
            pending: HashMap::new(),
        }
    }

    pub fn send(
        &mut self,
        state: &mut ConnState,
        req: Request,
        controls: MaybeControls,
    ) -> Result<RequestId> {
        let id = state.server.next_message_id();
        trace!("mock {} id={}", req.name(), id);
        match req {
            Request::Unbind => {
                self.bound_dn.clear();
                state.bound = false;
                return Ok(id);
            }
            Request::Abandon(_) => return Ok(id),
            _ => (),
        }
        let resp = self.respond(&req, controls.as_deref().unwrap_or(&[]))?;
        self.pending.insert(id, resp);
        state.outstanding.insert(
            id,
            Envelope {
                request: req,
                controls,
            },
        );
        Ok(id)
    }

    pub fn take(&mut self, state: &mut ConnState, id: RequestId) -> Result<Response> {
        let resp = self
            .pending
            .remove(&id)
            .ok_or(LdapError::NotOutstanding(id))?;
        finalize(state, id, resp)
    }

    fn respond(&mut self, req: &Request, controls: &[RawControl]) -> Result<Response> {
        Ok(match req {
            Request::Bind { name, auth } => self.bind(name, auth),
            Request::Search(s) => self.search(s, controls)?,
            Request::Compare { dn, attr, value } => {
                let dit = self.dit.read().expect("mock directory lock");
                match dit.compare(dn, attr, value) {
                    Ok(true) => result(ResponseType::CompareResponse, 6, ""),
                    Ok(false) => result(ResponseType::CompareResponse, 5, ""),
                    Err(e) => result(ResponseType::CompareResponse, e.rc(), e.to_string()),
                }
            }
            Request::Add { dn, attrs } => {
                let mut dit = self.dit.write().expect("mock directory lock");
                dit_result(ResponseType::AddResponse, dit.add_entry(dn, attrs.clone()))
            }
            Request::Delete { dn } => {
                let mut dit = self.dit.write().expect("mock directory lock");
                dit_result(ResponseType::DelResponse, dit.remove_entry(dn).map(|_| ()))
            }
            Request::Modify { dn, changes } => {
                let mut dit = self.dit.write().expect("mock directory lock");
                dit_result(ResponseType::ModifyResponse, dit.modify_entry(dn, changes))
            }
            Request::ModifyDn {
                dn,
                new_rdn,
                delete_old,
                new_superior,
            } => {
                let mut dit = self.dit.write().expect("mock directory lock");
                let res = dit.rename_entry(dn, new_rdn, *delete_old, new_superior.as_deref());
                dit_result(ResponseType::ModDnResponse, res)
            }
            Request::Extended(exop) => self.extended(exop),
            Request::Unbind | Request::Abandon(_) => {
                return Err(LdapError::Definition(format!("{} has no response", req.name())))
            }
        })
    }

    fn bind(&mut self, name: &str, auth: &BindAuth) -> Response {
        let rtype = ResponseType::BindResponse;
        let password = match auth {
            BindAuth::Simple(pw) => pw,
            BindAuth::Sasl { .. } => {
                return result(rtype, 7, "SASL not supported by the mock directory")
            }
        };
        if name.is_empty() {
            self.bound_dn.clear();
            return result(rtype, 0, "");
        }
        let dit = self.dit.read().expect("mock directory lock");
        match dit.check_password(name, password) {
            Ok(()) => {
                debug!("mock bind as {}", name);
                self.bound_dn = name.to_owned();
                result(rtype, 0, "")
            }
            Err(e) => {
                self.bound_dn.clear();
                result(rtype, e.rc(), e.to_string())
            }
        }
    }

    fn search(&self, s: &SearchRequest, controls: &[RawControl]) -> Result<Response> {
        let rtype = ResponseType::SearchResDone;
        let dit = self.dit.read().expect("mock directory lock");
        let mut found = match dit.search(&s.base, s.scope, &s.filter) {
            Ok(found) => found,
            Err(DitError::Unsupported(what)) => return Err(LdapError::Definition(what)),
            Err(e) => return Ok(result(rtype, e.rc(), e.to_string())),
        };
        drop(dit);
        let mut rc = 0;
        if s.size_limit > 0 && found.len() > s.size_limit as usize {
            found.truncate(s.size_limit as usize);
            rc = 4;
        }
        let mut ctrls = vec![];
        if let Some(raw) = controls.iter().find(|c| c.ctype == PAGED_RESULTS_OID) {
            let paging: PagedResults = raw.parse()?;
            let total = found.len();
            let offset = std::str::from_utf8(&paging.cookie)
                .ok()
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0)
                .min(total);
            let end = match paging.size {
                n if n > 0 => (offset + n as usize).min(total),
                _ => total,
            };
            found = found.drain(offset..end).collect();
            let cookie = if end < total {
                end.to_string().into_bytes()
            } else {
                vec![]
            };
            ctrls.push(Control::from(RawControl::from(PagedResults {
                size: total as i32,
                cookie,
            })));
        }
        let entries = found
            .iter()
            .map(|e| ResultEntry(entry_tag(e.dn(), project(e, &s.attrs, s.types_only)), vec![]))
            .collect();
        let mut resp = result(rtype, rc, "");
        resp.entries = entries;
        resp.result.ctrls = ctrls;
        Ok(resp)
    }

    fn extended(&self, exop: &Exop) -> Response {
        let rtype = ResponseType::ExtendedResp;
        match exop.name.as_deref() {
            Some(WHOAMI_OID) => {
                let mut resp = result(rtype, 0, "");
                let authzid = if self.bound_dn.is_empty() {
                    String::new()
                } else {
                    format!("dn:{}", self.bound_dn)
                };
                resp.exop.val = Some(authzid.into_bytes());
                resp
            }
            Some(STARTTLS_OID) => {
                let mut resp = result(rtype, 0, "");
                resp.exop.name = Some(STARTTLS_OID.to_owned());
                resp
            }
            _ => result(rtype, 2, "unsupported extended operation"),
        }
    }
}

/// Attributes of an entry selected by the requested attribute list.
///
/// `*` (or no list) selects the user attributes, `+` the operational ones;
/// `1.1` selects nothing unless other names are also given.
fn project(entry: &Entry, attrs: &[String], types_only: bool) -> Vec<(String, Vec<Vec<u8>>)> {
    let all_user = attrs.is_empty() || attrs.iter().any(|a| a == "*");
    let all_operational = attrs.iter().any(|a| a == "+");
    entry
        .attributes()
        .filter(|a| {
            let by_class = if Entry::is_operational(&a.name) {
                all_operational
            } else {
                all_user
            };
            by_class || attrs.iter().any(|r| r.eq_ignore_ascii_case(&a.name))
        })
        .map(|a| {
            let values = if types_only { vec![] } else { a.values.clone() };
            (a.name.clone(), values)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::LdapConnSettings;
    use crate::search::{Scope, SearchEntry, SearchOptions};
    use crate::server::ServerPool;

    fn setup() -> (MockStrategy, ConnState) {
        let mut dit = Dit::new();
        dit.add_entry("dc=example", vec![("dc", vec!["example"])]).unwrap();
        for i in 0..5 {
            let dn = format!("cn=user{},dc=example", i);
            let pw = format!("pw{}", i);
            dit.add_entry(&dn, vec![("userPassword", vec![pw.as_str()])]).unwrap();
        }
        let server = Server::mock("mock", dit);
        let pool = Arc::new(ServerPool::single(server.clone()));
        let state = ConnState::new(pool, server.clone(), LdapConnSettings::new());
        (MockStrategy::new(&server), state)
    }

    fn run(m: &mut MockStrategy, state: &mut ConnState, req: Request, ctrls: MaybeControls) -> Response {
        let id = m.send(state, req, ctrls).unwrap();
        m.take(state, id).unwrap()
    }

    #[test]
    fn bind_and_whoami() {
        let (mut m, mut state) = setup();
        let resp = run(&mut m, &mut state, Request::simple_bind("cn=user1,dc=example", "nope"), None);
        assert_eq!(resp.result.rc, 49);
        let resp = run(&mut m, &mut state, Request::simple_bind("cn=user1,dc=example", "pw1"), None);
        assert_eq!(resp.result.rc, 0);
        assert!(state.bound);
        let resp = run(&mut m, &mut state, Request::Extended(Exop::from(crate::exop::WhoAmI)), None);
        assert_eq!(resp.exop.val.as_deref(), Some(&b"dn:cn=user1,dc=example"[..]));
        let resp = run(&mut m, &mut state, Request::sasl_bind("EXTERNAL", None), None);
        assert_eq!(resp.result.rc, 7);
    }

    #[test]
    fn size_limit_and_projection() {
        let (mut m, mut state) = setup();
        let req = Request::search(
            "dc=example",
            Scope::OneLevel,
            "(cn=user*)",
            &["1.1"],
            SearchOptions::new().sizelimit(2),
        )
        .unwrap();
        let resp = run(&mut m, &mut state, req, None);
        assert_eq!(resp.result.rc, 4);
        assert_eq!(resp.entries.len(), 2);
        let entry = SearchEntry::construct(resp.entries[0].clone()).unwrap();
        assert!(entry.attrs.is_empty());

        let req = Request::search("cn=user0,dc=example", Scope::Base, "(objectClass=*)", &["+"], SearchOptions::new())
            .unwrap();
        let resp = run(&mut m, &mut state, req, None);
        assert_eq!(resp.result.rc, 0);
        let req = Request::search("cn=user0,dc=example", Scope::Base, "(cn=*)", &["+"], SearchOptions::new())
            .unwrap();
        let resp = run(&mut m, &mut state, req, None);
        let entry = SearchEntry::construct(resp.entries[0].clone()).unwrap();
        assert_eq!(entry.attrs.keys().collect::<Vec<_>>(), vec!["entryDN"]);
    }

    #[test]
    fn paged_search() {
        let (mut m, mut state) = setup();
        let mut cookie = vec![];
        let mut seen = 0;
        loop {
            let req = Request::search("dc=example", Scope::OneLevel, "(cn=*)", &["cn"], SearchOptions::new())
                .unwrap();
            let ctrl = RawControl::from(PagedResults { size: 2, cookie });
            let resp = run(&mut m, &mut state, req, Some(vec![ctrl]));
            seen += resp.entries.len();
            let paged: PagedResults = resp.result.ctrls[0].1.parse().unwrap();
            assert_eq!(paged.size, 5);
            if paged.cookie.is_empty() {
                break;
            }
            cookie = paged.cookie;
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn extensible_filter_fails_to_send() {
        let (mut m, mut state) = setup();
        let req = Request::search("dc=example", Scope::Subtree, "(cn:dn:=x)", &["cn"], SearchOptions::new())
            .unwrap();
        let err = m.send(&mut state, req, None).unwrap_err();
        assert_eq!(err.kind(), crate::result::ErrorKind::Definition);
    }

    #[test]
    fn writes() {
        let (mut m, mut state) = setup();
        let add = Request::Add {
            dn: "cn=user0,dc=example".into(),
            attrs: vec![("sn".into(), vec![b"x".to_vec()])],
        };
        assert_eq!(run(&mut m, &mut state, add, None).result.rc, 68);
        let del = Request::Delete { dn: "dc=example".into() };
        assert_eq!(run(&mut m, &mut state, del, None).result.rc, 66);
        let cmp = Request::Compare {
            dn: "cn=user2,dc=example".into(),
            attr: "userPassword".into(),
            value: b"pw2".to_vec(),
        };
        assert_eq!(run(&mut m, &mut state, cmp, None).result.rc, 6);
    }
}
