//! Scripted in-process LDAP server for the integration tests.
//!
//! The server answers every request with a canned success, framing the
//! incoming stream with the crate's own `compute_message_length()`. A `Script`
//! makes it misbehave in the ways the connection strategies must survive.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use ldapcore::asn1::{
    parse_tag, parse_uint, write, ASNTag, Enumerated, Integer, OctetString, Sequence, Set,
    StructureTag, Tag, TagClass,
};
use ldapcore::compute_message_length;

pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

#[derive(Clone, Debug, Default)]
pub struct Script {
    /// Number of connections closed right after they're accepted.
    pub drop_first: usize,
    /// Close every connection right after accepting it.
    pub drop_all: bool,
    /// Pause before answering each request.
    pub delay: Duration,
    /// Answer the n-th request (from 1, over all connections) with a notice of
    /// disconnection and close the connection.
    pub notice_at: Option<usize>,
    /// Answer with a message id which doesn't match the request.
    pub wrong_id: bool,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub accepted: AtomicUsize,
    pub requests: AtomicUsize,
    pub binds: AtomicUsize,
    pub unbinds: AtomicUsize,
    pub abandons: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeServer {
    pub url: String,
    pub stats: Arc<Stats>,
}

impl FakeServer {
    pub fn start(script: Script) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ldap://127.0.0.1:{}", listener.local_addr().unwrap().port());
        let stats = Arc::new(Stats::default());
        let st = stats.clone();
        thread::spawn(move || {
            for (n, stream) in listener.incoming().enumerate() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                st.accepted.fetch_add(1, Ordering::SeqCst);
                if script.drop_all || n < script.drop_first {
                    drop(stream);
                    continue;
                }
                let script = script.clone();
                let st = st.clone();
                thread::spawn(move || serve(stream, script, st));
            }
        });
        FakeServer { url, stats }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn serve(mut stream: TcpStream, script: Script, stats: Arc<Stats>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let len = match compute_message_length(&buf) {
            Ok(Some(len)) => len,
            Ok(None) => match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
            },
            Err(_) => return,
        };
        let msg = buf.drain(..len).collect::<Vec<_>>();
        let (id, op) = match parse_message(&msg) {
            Some(parsed) => parsed,
            None => return,
        };
        match op.id {
            2 => {
                stats.unbinds.fetch_add(1, Ordering::SeqCst);
                return;
            }
            16 => {
                stats.abandons.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            _ => (),
        }
        let count = stats.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if script.notice_at == Some(count) {
            let notice = result_op(
                24,
                52,
                vec![Tag::OctetString(OctetString {
                    id: 10,
                    class: TagClass::Context,
                    inner: NOTICE_OF_DISCONNECTION_OID.as_bytes().to_vec(),
                })],
            );
            let _ = stream.write_all(&message(0, notice));
            return;
        }
        let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(active, Ordering::SeqCst);
        thread::sleep(script.delay);
        let reply_id = if script.wrong_id { id + 100 } else { id };
        let replies = respond(reply_id, op, &stats);
        stats.active.fetch_sub(1, Ordering::SeqCst);
        for reply in replies {
            if stream.write_all(&reply).is_err() {
                return;
            }
        }
    }
}

fn parse_message(bytes: &[u8]) -> Option<(i64, StructureTag)> {
    let (_, tag) = parse_tag(bytes).ok()?;
    let mut parts = tag.expect_constructed()?.into_iter();
    let id = parts.next()?.expect_primitive()?;
    let (_, id) = parse_uint(&id).ok()?;
    Some((id as i64, parts.next()?))
}

fn octet_string(val: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        inner: val.to_vec(),
        ..Default::default()
    })
}

fn message(id: i64, op: Tag) -> Vec<u8> {
    let msg = Tag::Sequence(Sequence {
        inner: vec![
            Tag::Integer(Integer {
                inner: id,
                ..Default::default()
            }),
            op,
        ],
        ..Default::default()
    });
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, msg.into_structure()).unwrap();
    buf.to_vec()
}

fn result_op(op: u64, rc: i64, extra: Vec<Tag>) -> Tag {
    let mut inner = vec![
        Tag::Enumerated(Enumerated {
            inner: rc,
            ..Default::default()
        }),
        octet_string(b""),
        octet_string(b""),
    ];
    inner.extend(extra);
    Tag::Sequence(Sequence {
        id: op,
        class: TagClass::Application,
        inner,
    })
}

fn respond(id: i64, op: StructureTag, stats: &Stats) -> Vec<Vec<u8>> {
    let op_id = op.id;
    let mut parts = op.expect_constructed().unwrap_or_default().into_iter();
    match op_id {
        0 => {
            stats.binds.fetch_add(1, Ordering::SeqCst);
            let password = parts.nth(2).and_then(|t| t.expect_primitive());
            let rc = if password.as_deref() == Some(&b"bad"[..]) { 49 } else { 0 };
            vec![message(id, result_op(1, rc, vec![]))]
        }
        3 => {
            let base = parts
                .next()
                .and_then(|t| t.expect_primitive())
                .unwrap_or_default();
            let entry = Tag::Sequence(Sequence {
                id: 4,
                class: TagClass::Application,
                inner: vec![
                    octet_string(&base),
                    Tag::Sequence(Sequence {
                        inner: vec![Tag::Sequence(Sequence {
                            inner: vec![
                                octet_string(b"cn"),
                                Tag::Set(Set {
                                    inner: vec![octet_string(b"fake")],
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })],
                        ..Default::default()
                    }),
                ],
            });
            vec![message(id, entry), message(id, result_op(5, 0, vec![]))]
        }
        6 | 8 | 12 => vec![message(id, result_op(op_id + 1, 0, vec![]))],
        10 => vec![message(id, result_op(11, 0, vec![]))],
        14 => vec![message(id, result_op(15, 6, vec![]))],
        23 => {
            let name = parts
                .next()
                .and_then(|t| t.expect_primitive())
                .unwrap_or_default();
            if name == WHOAMI_OID.as_bytes() {
                let val = Tag::OctetString(OctetString {
                    id: 11,
                    class: TagClass::Context,
                    inner: b"dn:cn=fake".to_vec(),
                });
                vec![message(id, result_op(24, 0, vec![val]))]
            } else {
                vec![message(id, result_op(24, 2, vec![]))]
            }
        }
        _ => vec![message(id, result_op(24, 2, vec![]))],
    }
}
