//! Rendering of write requests as LDIF change records (RFC 2849).

use std::collections::HashMap;

use crate::conn::ConnState;
use crate::controls::RawControl;
use crate::protocol::MaybeControls;
use crate::request::{Change, ModOp, Request};
use crate::result::{LdapError, LdapResult, Response, ResponseType, Result};
use crate::RequestId;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const LINE_WIDTH: usize = 76;

/// Strategy which produces LDIF instead of network traffic.
pub(crate) struct Ldif {
    pending: HashMap<RequestId, Response>,
}

impl Ldif {
    pub fn new() -> Ldif {
        Ldif {
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
        let rtype = match req {
            Request::Add { .. } => ResponseType::AddResponse,
            Request::Delete { .. } => ResponseType::DelResponse,
            Request::Modify { .. } => ResponseType::ModifyResponse,
            Request::ModifyDn { .. } => ResponseType::ModDnResponse,
            Request::Unbind => return Ok(id),
            ref other => {
                return Err(LdapError::Definition(format!(
                    "{} not allowed in LDIF mode",
                    other.name()
                )))
            }
        };
        let text = render(&req, controls.as_deref().unwrap_or(&[]));
        trace!("rendered {} as LDIF, id={}", req.name(), id);
        let mut resp = Response::from_result(LdapResult::new(rtype, 0, ""));
        resp.ldif = Some(text);
        self.pending.insert(id, resp);
        Ok(id)
    }

    pub fn take(&mut self, id: RequestId) -> Result<Response> {
        self.pending.remove(&id).ok_or(LdapError::NotOutstanding(id))
    }
}

/// RFC 2849 SAFE-STRING: ASCII without NUL, CR and LF, not starting with
/// a space, colon or `<`. Trailing spaces are also encoded.
fn is_safe(val: &[u8]) -> bool {
    match val.first() {
        None => return true,
        Some(b' ' | b':' | b'<') => return false,
        _ => (),
    }
    val.last() != Some(&b' ')
        && val
            .iter()
            .all(|&b| b != 0 && b != b'\n' && b != b'\r' && b < 0x80)
}

fn attr_line(attr: &str, val: &[u8]) -> String {
    if is_safe(val) {
        format!("{}: {}", attr, String::from_utf8_lossy(val))
    } else {
        format!("{}:: {}", attr, BASE64.encode(val))
    }
}

fn control_line(ctrl: &RawControl) -> String {
    let crit = if ctrl.crit { "true" } else { "false" };
    match ctrl.val {
        None => format!("control: {} {}", ctrl.ctype, crit),
        Some(ref val) if is_safe(val) => format!(
            "control: {} {}: {}",
            ctrl.ctype,
            crit,
            String::from_utf8_lossy(val)
        ),
        Some(ref val) => format!("control: {} {}:: {}", ctrl.ctype, crit, BASE64.encode(val)),
    }
}

fn change_lines(change: &Change, lines: &mut Vec<String>) {
    let op = match change.op {
        ModOp::Add => "add",
        ModOp::Delete => "delete",
        ModOp::Replace => "replace",
        ModOp::Increment => "increment",
    };
    lines.push(format!("{}: {}", op, change.attr));
    for val in &change.values {
        lines.push(attr_line(&change.attr, val));
    }
    lines.push("-".to_owned());
}

/// Split a line into chunks of at most `LINE_WIDTH` bytes, continuation
/// lines starting with a single space. Never splits a UTF-8 sequence.
fn fold(line: &str) -> String {
    if line.len() <= LINE_WIDTH {
        return line.to_owned();
    }
    let mut out = String::with_capacity(line.len() + line.len() / LINE_WIDTH * 2);
    let mut width = 0;
    let mut limit = LINE_WIDTH;
    for c in line.chars() {
        if width + c.len_utf8() > limit {
            out.push_str("\n ");
            width = 0;
            limit = LINE_WIDTH - 1;
        }
        out.push(c);
        width += c.len_utf8();
    }
    out
}

/// Change record for a write request, lines joined with newlines and
/// terminated by one.
pub(crate) fn render(req: &Request, controls: &[RawControl]) -> String {
    let mut lines = vec![];
    let dn = match req {
        Request::Add { dn, .. }
        | Request::Delete { dn }
        | Request::Modify { dn, .. }
        | Request::ModifyDn { dn, .. } => dn,
        _ => return String::new(),
    };
    lines.push(attr_line("dn", dn.as_bytes()));
    lines.extend(controls.iter().map(control_line));
    match req {
        Request::Add { attrs, .. } => {
            lines.push("changetype: add".to_owned());
            for (attr, vals) in attrs {
                for val in vals {
                    lines.push(attr_line(attr, val));
                }
            }
        }
        Request::Delete { .. } => lines.push("changetype: delete".to_owned()),
        Request::Modify { changes, .. } => {
            lines.push("changetype: modify".to_owned());
            for change in changes {
                change_lines(change, &mut lines);
            }
        }
        Request::ModifyDn {
            new_rdn,
            delete_old,
            new_superior,
            ..
        } => {
            lines.push("changetype: modrdn".to_owned());
            lines.push(attr_line("newrdn", new_rdn.as_bytes()));
            lines.push(format!("deleteoldrdn: {}", if *delete_old { 1 } else { 0 }));
            if let Some(sup) = new_superior {
                lines.push(attr_line("newsuperior", sup.as_bytes()));
            }
        }
        _ => (),
    }
    let mut text = lines.iter().map(|l| fold(l)).collect::<Vec<_>>().join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_record() {
        let req = Request::Add {
            dn: "cn=alice,dc=example,dc=org".into(),
            attrs: vec![
                ("objectClass".into(), vec![b"top".to_vec(), b"person".to_vec()]),
                ("sn".into(), vec![b"Smith".to_vec()]),
            ],
        };
        assert_eq!(
            render(&req, &[]),
            "dn: cn=alice,dc=example,dc=org\n\
             changetype: add\n\
             objectClass: top\n\
             objectClass: person\n\
             sn: Smith\n"
        );
    }

    #[test]
    fn modify_record() {
        let req = Request::Modify {
            dn: "cn=bob,dc=example".into(),
            changes: vec![
                Change {
                    op: ModOp::Replace,
                    attr: "mail".into(),
                    values: vec![b"bob@example.org".to_vec()],
                },
                Change {
                    op: ModOp::Delete,
                    attr: "phone".into(),
                    values: vec![],
                },
            ],
        };
        assert_eq!(
            render(&req, &[]),
            "dn: cn=bob,dc=example\n\
             changetype: modify\n\
             replace: mail\n\
             mail: bob@example.org\n\
             -\n\
             delete: phone\n\
             -\n"
        );
    }

    #[test]
    fn modrdn_and_control() {
        let req = Request::ModifyDn {
            dn: "cn=bob,dc=example".into(),
            new_rdn: "cn=robert".into(),
            delete_old: true,
            new_superior: Some("ou=people,dc=example".into()),
        };
        let ctrl = RawControl {
            ctype: "1.3.6.1.4.1.4203.1.10.1".into(),
            crit: true,
            val: None,
        };
        assert_eq!(
            render(&req, &[ctrl]),
            "dn: cn=bob,dc=example\n\
             control: 1.3.6.1.4.1.4203.1.10.1 true\n\
             changetype: modrdn\n\
             newrdn: cn=robert\n\
             deleteoldrdn: 1\n\
             newsuperior: ou=people,dc=example\n"
        );
    }

    #[test]
    fn unsafe_values_are_base64() {
        assert_eq!(attr_line("cn", b" lead"), "cn:: IGxlYWQ=");
        assert_eq!(attr_line("cn", b":x"), "cn:: Ong=");
        assert_eq!(attr_line("cn", "Jos\u{e9}".as_bytes()), "cn:: Sm9zw6k=");
        assert_eq!(attr_line("cn", b"plain"), "cn: plain");
    }

    #[test]
    fn long_lines_fold() {
        let val = "x".repeat(100);
        let folded = fold(&format!("description: {}", val));
        let lines = folded.split('\n').collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), LINE_WIDTH);
        assert!(lines[1].starts_with(' '));
        let unfolded = lines[0].to_owned() + &lines[1][1..];
        assert_eq!(unfolded, format!("description: {}", val));
    }

    #[test]
    fn search_is_rejected() {
        use crate::search::{Scope, SearchOptions};
        use crate::server::{Server, ServerPool};
        use std::sync::Arc;

        let server = Server::new("ldap://localhost").unwrap();
        let pool = Arc::new(ServerPool::single(server.clone()));
        let mut state = ConnState::new(pool, server, crate::conn::LdapConnSettings::new());
        let mut ldif = Ldif::new();
        let req = Request::search("dc=example", Scope::Base, "(objectClass=*)", &["cn"], SearchOptions::new())
            .unwrap();
        let err = ldif.send(&mut state, req, None).unwrap_err();
        assert_eq!(err.kind(), crate::result::ErrorKind::Definition);
        let id = ldif
            .send(&mut state, Request::Delete { dn: "cn=x".into() }, None)
            .unwrap();
        let resp = ldif.take(id).unwrap();
        assert_eq!(resp.result.rtype, ResponseType::DelResponse);
        assert_eq!(resp.ldif.as_deref(), Some("dn: cn=x\nchangetype: delete\n"));
    }
}
