use std::collections::HashSet;
use std::hash::Hash;

use crate::exop::Exop;
use crate::exop_impl::exop_tag;
use crate::filter::{parse as parse_filter, Filter};
use crate::protocol::MaybeControls;
use crate::result::{LdapError, Result};
use crate::search::{DerefAliases, Scope, SearchOptions};
use crate::util::LdapUrlParams;
use crate::RequestId;

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

/// Possible sub-operations for the Modify operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add an attribute, with at least one value.
    Add(S, HashSet<S>),
    /// Delete the entire attribute, or the given values of an attribute.
    Delete(S, HashSet<S>),
    /// Replace an existing attribute, setting its values to those in the set, or delete it if no values are given.
    Replace(S, HashSet<S>),
    /// Increment the attribute by the given value.
    Increment(S, S),
}

/// Modify operation type, with its protocol value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModOp {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

/// One change in a Modify request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub op: ModOp,
    pub attr: String,
    pub values: Vec<Vec<u8>>,
}

impl<S: AsRef<[u8]> + Eq + Hash> From<Mod<S>> for Change {
    fn from(m: Mod<S>) -> Change {
        let (op, attr, values) = match m {
            Mod::Add(attr, set) => (ModOp::Add, attr, set.into_iter().collect()),
            Mod::Delete(attr, set) => (ModOp::Delete, attr, set.into_iter().collect()),
            Mod::Replace(attr, set) => (ModOp::Replace, attr, set.into_iter().collect()),
            Mod::Increment(attr, val) => (ModOp::Increment, attr, vec![val]),
        };
        Change {
            op,
            attr: String::from_utf8_lossy(attr.as_ref()).into_owned(),
            values: values.into_iter().map(|v: S| v.as_ref().to_vec()).collect(),
        }
    }
}

/// Credentials of a Bind request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindAuth {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

/// Parameters of a Search request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attrs: Vec<String>,
}

/// An LDAP request, before it's assigned a message id.
///
/// Requests are built by the operation methods of [`LdapConn`](crate::LdapConn), and can
/// also be constructed directly for use with the two-phase
/// [`send()`](crate::LdapConn::send)/[`get_response()`](crate::LdapConn::get_response)
/// interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Bind { name: String, auth: BindAuth },
    Unbind,
    Search(SearchRequest),
    Modify { dn: String, changes: Vec<Change> },
    Add {
        dn: String,
        attrs: Vec<(String, Vec<Vec<u8>>)>,
    },
    Delete { dn: String },
    ModifyDn {
        dn: String,
        new_rdn: String,
        delete_old: bool,
        new_superior: Option<String>,
    },
    Compare {
        dn: String,
        attr: String,
        value: Vec<u8>,
    },
    Abandon(RequestId),
    Extended(Exop),
}

impl Request {
    /// Simple Bind with the provided DN and password.
    pub fn simple_bind(bind_dn: &str, bind_pw: &str) -> Request {
        Request::Bind {
            name: bind_dn.to_owned(),
            auth: BindAuth::Simple(bind_pw.as_bytes().to_vec()),
        }
    }

    /// SASL Bind with the given mechanism and optional credentials.
    pub fn sasl_bind(mechanism: &str, credentials: Option<&[u8]>) -> Request {
        Request::Bind {
            name: String::new(),
            auth: BindAuth::Sasl {
                mechanism: mechanism.to_owned(),
                credentials: credentials.map(<[u8]>::to_vec),
            },
        }
    }

    /// Search request. The filter is parsed immediately.
    pub fn search<S: AsRef<str>>(
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[S],
        opts: SearchOptions,
    ) -> Result<Request> {
        Ok(Request::Search(SearchRequest {
            base: base.to_owned(),
            scope,
            deref: opts.deref,
            size_limit: opts.sizelimit,
            time_limit: opts.timelimit,
            types_only: opts.typesonly,
            filter: parse_filter(filter)?,
            attrs: attrs.iter().map(|a| a.as_ref().to_owned()).collect(),
        }))
    }

    /// Add request. None of the value sets may be empty.
    pub fn add<S: AsRef<[u8]> + Eq + Hash>(dn: &str, attrs: Vec<(S, HashSet<S>)>) -> Result<Request> {
        let mut converted = Vec::with_capacity(attrs.len());
        for (name, vals) in attrs {
            if vals.is_empty() {
                return Err(LdapError::AddNoValues);
            }
            converted.push((
                String::from_utf8_lossy(name.as_ref()).into_owned(),
                vals.into_iter().map(|v| v.as_ref().to_vec()).collect(),
            ));
        }
        Ok(Request::Add {
            dn: dn.to_owned(),
            attrs: converted,
        })
    }

    /// Modify request. An `Add` change must have at least one value.
    pub fn modify<S: AsRef<[u8]> + Eq + Hash>(dn: &str, mods: Vec<Mod<S>>) -> Result<Request> {
        let changes = mods.into_iter().map(Change::from).collect::<Vec<_>>();
        if changes
            .iter()
            .any(|c| c.op == ModOp::Add && c.values.is_empty())
        {
            return Err(LdapError::AddNoValues);
        }
        Ok(Request::Modify {
            dn: dn.to_owned(),
            changes,
        })
    }

    /// Extended request. The operation must be named.
    pub fn extended(exop: Exop) -> Result<Request> {
        if exop.name.is_none() {
            return Err(LdapError::Configuration(
                "extended operation without a name".into(),
            ));
        }
        Ok(Request::Extended(exop))
    }

    /// Protocol name of the request.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Bind { .. } => "bindRequest",
            Request::Unbind => "unbindRequest",
            Request::Search(_) => "searchRequest",
            Request::Modify { .. } => "modifyRequest",
            Request::Add { .. } => "addRequest",
            Request::Delete { .. } => "delRequest",
            Request::ModifyDn { .. } => "modDNRequest",
            Request::Compare { .. } => "compareRequest",
            Request::Abandon(_) => "abandonRequest",
            Request::Extended(_) => "extendedReq",
        }
    }

    pub(crate) fn is_search(&self) -> bool {
        matches!(self, Request::Search(_))
    }

    /// True for the operations which change the directory.
    pub(crate) fn is_write(&self) -> bool {
        matches!(
            self,
            Request::Modify { .. }
                | Request::Add { .. }
                | Request::Delete { .. }
                | Request::ModifyDn { .. }
        )
    }

    /// True for the operations to which the server never responds.
    pub(crate) fn expects_response(&self) -> bool {
        !matches!(self, Request::Unbind | Request::Abandon(_))
    }

    /// Copy of the request retargeted according to a referral URL.
    pub(crate) fn for_referral(&self, params: &LdapUrlParams) -> Result<Request> {
        let mut req = self.clone();
        let base = &params.base;
        match req {
            Request::Search(ref mut s) => {
                if !base.is_empty() {
                    s.base = base.clone();
                }
                if let Some(scope) = params.scope {
                    s.scope = scope;
                }
                if let Some(ref filter) = params.filter {
                    s.filter = parse_filter(filter)?;
                }
            }
            Request::Modify { ref mut dn, .. }
            | Request::Add { ref mut dn, .. }
            | Request::Delete { ref mut dn }
            | Request::ModifyDn { ref mut dn, .. }
            | Request::Compare { ref mut dn, .. } => {
                if !base.is_empty() {
                    *dn = base.clone();
                }
            }
            _ => (),
        }
        Ok(req)
    }

    /// BER form of the protocol op.
    pub(crate) fn to_tag(&self) -> Tag {
        match self {
            Request::Bind { name, auth } => bind_tag(name, auth),
            Request::Unbind => Tag::Null(Null {
                id: 2,
                class: TagClass::Application,
                inner: (),
            }),
            Request::Search(s) => search_tag(s),
            Request::Modify { dn, changes } => modify_tag(dn, changes),
            Request::Add { dn, attrs } => Tag::Sequence(Sequence {
                id: 8,
                class: TagClass::Application,
                inner: vec![
                    octet_string(dn.as_bytes()),
                    Tag::Sequence(Sequence {
                        inner: attrs
                            .iter()
                            .map(|(name, vals)| attribute_tag(name, vals))
                            .collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::Delete { dn } => Tag::OctetString(OctetString {
                id: 10,
                class: TagClass::Application,
                inner: Vec::from(dn.as_bytes()),
            }),
            Request::ModifyDn {
                dn,
                new_rdn,
                delete_old,
                new_superior,
            } => {
                let mut params = vec![
                    octet_string(dn.as_bytes()),
                    octet_string(new_rdn.as_bytes()),
                    Tag::Boolean(Boolean {
                        inner: *delete_old,
                        ..Default::default()
                    }),
                ];
                if let Some(new_sup) = new_superior {
                    params.push(Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: Vec::from(new_sup.as_bytes()),
                    }));
                }
                Tag::Sequence(Sequence {
                    id: 12,
                    class: TagClass::Application,
                    inner: params,
                })
            }
            Request::Compare { dn, attr, value } => Tag::Sequence(Sequence {
                id: 14,
                class: TagClass::Application,
                inner: vec![
                    octet_string(dn.as_bytes()),
                    Tag::Sequence(Sequence {
                        inner: vec![octet_string(attr.as_bytes()), octet_string(value)],
                        ..Default::default()
                    }),
                ],
            }),
            Request::Abandon(msgid) => Tag::Integer(Integer {
                id: 16,
                class: TagClass::Application,
                inner: *msgid as i64,
            }),
            Request::Extended(exop) => exop_tag(exop.clone()),
        }
    }
}

fn octet_string(val: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        inner: val.to_vec(),
        ..Default::default()
    })
}

fn attribute_tag(name: &str, vals: &[Vec<u8>]) -> Tag {
    Tag::Sequence(Sequence {
        inner: vec![
            octet_string(name.as_bytes()),
            Tag::Set(Set {
                inner: vals.iter().map(|v| octet_string(v)).collect(),
                ..Default::default()
            }),
        ],
        ..Default::default()
    })
}

fn bind_tag(name: &str, auth: &BindAuth) -> Tag {
    let auth = match auth {
        BindAuth::Simple(pw) => Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: pw.clone(),
        }),
        BindAuth::Sasl {
            mechanism,
            credentials,
        } => {
            let mut inner_vec = vec![octet_string(mechanism.as_bytes())];
            if let Some(creds) = credentials {
                inner_vec.push(octet_string(creds));
            }
            Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Context,
                inner: inner_vec,
            })
        }
    };
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            octet_string(name.as_bytes()),
            auth,
        ],
    })
}

fn search_tag(s: &SearchRequest) -> Tag {
    Tag::Sequence(Sequence {
        id: 3,
        class: TagClass::Application,
        inner: vec![
            octet_string(s.base.as_bytes()),
            Tag::Enumerated(Enumerated {
                inner: s.scope as i64,
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: s.deref as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: s.size_limit as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: s.time_limit as i64,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: s.types_only,
                ..Default::default()
            }),
            s.filter.to_tag(),
            Tag::Sequence(Sequence {
                inner: s.attrs.iter().map(|a| octet_string(a.as_bytes())).collect(),
                ..Default::default()
            }),
        ],
    })
}

fn modify_tag(dn: &str, changes: &[Change]) -> Tag {
    Tag::Sequence(Sequence {
        id: 6,
        class: TagClass::Application,
        inner: vec![
            octet_string(dn.as_bytes()),
            Tag::Sequence(Sequence {
                inner: changes
                    .iter()
                    .map(|c| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                Tag::Enumerated(Enumerated {
                                    inner: c.op as i64,
                                    ..Default::default()
                                }),
                                attribute_tag(&c.attr, &c.values),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

/// A request together with the controls it was sent with.
///
/// Kept for every request awaiting a response, so that it can be
/// resent after a reconnection or re-targeted by a referral.
#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub request: Request,
    pub controls: MaybeControls,
}

#[cfg(test)]
mod test {
    use super::*;

    use bytes::BytesMut;
    use lber::structures::ASNTag;
    use lber::write;

    fn ber(req: &Request) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, req.to_tag().into_structure()).unwrap();
        buf.to_vec()
    }

    #[test]
    fn delete_encoding() {
        let req = Request::Delete { dn: "dc=x".into() };
        assert_eq!(ber(&req), b"\x4a\x04dc=x");
    }

    #[test]
    fn abandon_and_unbind_encoding() {
        assert_eq!(ber(&Request::Abandon(5)), b"\x50\x01\x05");
        assert_eq!(ber(&Request::Unbind), b"\x42\x00");
        assert!(!Request::Unbind.expects_response());
    }

    #[test]
    fn add_rejects_empty_values() {
        let attrs = vec![("cn", HashSet::new())];
        assert!(matches!(
            Request::add("cn=x", attrs),
            Err(LdapError::AddNoValues)
        ));
    }

    #[test]
    fn modify_changes() {
        let req = Request::modify(
            "cn=x",
            vec![
                Mod::Replace("sn", HashSet::from(["y"])),
                Mod::Increment("n", "2"),
            ],
        )
        .unwrap();
        match req {
            Request::Modify { changes, .. } => {
                assert_eq!(changes[0].op, ModOp::Replace);
                assert_eq!(changes[1].values, vec![b"2".to_vec()]);
            }
            _ => panic!("not a modify"),
        }
    }

    #[test]
    fn referral_retargeting() {
        let req = Request::search(
            "dc=example",
            Scope::Subtree,
            "(cn=a)",
            &["cn"],
            SearchOptions::new(),
        )
        .unwrap();
        let params = LdapUrlParams {
            base: "ou=moved,dc=example".into(),
            attrs: None,
            scope: Some(Scope::OneLevel),
            filter: None,
        };
        match req.for_referral(&params).unwrap() {
            Request::Search(s) => {
                assert_eq!(s.base, "ou=moved,dc=example");
                assert_eq!(s.scope, Scope::OneLevel);
                assert_eq!(s.filter, parse_filter("(cn=a)").unwrap());
            }
            _ => panic!("not a search"),
        }
    }
}
