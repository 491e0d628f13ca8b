mod common;

use std::time::Duration;

use common::{init_logging, FakeServer, Script, Stats};
use ldapcore::{
    ClientStrategy, ErrorKind, LdapConn, LdapConnSettings, LdapError, Request, Scope,
    SearchEntry, SearchOptions, Server,
};

#[test]
fn bind_search_compare_unbind() {
    init_logging();
    let server = FakeServer::start(Script::default());
    let mut ldap = LdapConn::new(&server.url).unwrap();
    assert_eq!(ldap.strategy(), ClientStrategy::Sync);
    ldap.simple_bind("cn=admin,dc=example", "secret")
        .unwrap()
        .success()
        .unwrap();
    let (rs, res) = ldap
        .search("dc=example", Scope::Base, "(objectClass=*)", vec!["cn"])
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(rs.len(), 1);
    let entry = SearchEntry::construct(rs.into_iter().next().unwrap()).unwrap();
    assert_eq!(entry.dn, "dc=example");
    assert_eq!(entry.attrs["cn"], vec!["fake".to_owned()]);
    assert!(ldap.compare("dc=example", "cn", "fake").unwrap().equal().unwrap());
    assert_eq!(ldap.who_am_i().unwrap().as_deref(), Some("dn:cn=fake"));
    ldap.unbind().unwrap();
    assert!(ldap.is_closed());
}

#[test]
fn failed_bind_is_a_result() {
    let server = FakeServer::start(Script::default());
    let mut ldap = LdapConn::new(&server.url).unwrap();
    let resp = ldap.simple_bind("cn=admin,dc=example", "bad").unwrap();
    assert_eq!(resp.result.rc, 49);
    assert!(!ldap.is_bound());
    assert!(ldap.simple_bind("cn=admin,dc=example", "bad").unwrap().success().is_err());
}

#[test]
fn mismatched_message_id_is_fatal() {
    let server = FakeServer::start(Script {
        wrong_id: true,
        ..Default::default()
    });
    let mut ldap = LdapConn::new(&server.url).unwrap();
    let err = ldap.simple_bind("cn=admin,dc=example", "secret").unwrap_err();
    assert!(matches!(err, LdapError::SocketReceive(_)));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(!err.is_recoverable());
    assert!(ldap.last_error().is_some());
}

#[test]
fn notice_of_disconnection_closes_connection() {
    let server = FakeServer::start(Script {
        notice_at: Some(2),
        ..Default::default()
    });
    let mut ldap = LdapConn::new(&server.url).unwrap();
    ldap.simple_bind("cn=admin,dc=example", "secret")
        .unwrap()
        .success()
        .unwrap();
    let err = ldap
        .search("dc=example", Scope::Base, "(objectClass=*)", vec!["cn"])
        .unwrap_err();
    assert!(matches!(err, LdapError::SessionTerminated));
    assert!(err.is_recoverable());
    assert!(ldap.is_closed());
    assert!(!ldap.is_bound());
}

#[test]
fn usage_counters() {
    let server = FakeServer::start(Script::default());
    let settings = LdapConnSettings::new().set_collect_usage(true);
    let mut ldap = LdapConn::with_settings(settings, &server.url).unwrap();
    ldap.simple_bind("cn=admin,dc=example", "secret").unwrap();
    ldap.search("dc=example", Scope::Base, "(objectClass=*)", vec!["cn"])
        .unwrap();
    let usage = ldap.usage().unwrap();
    assert_eq!(usage.open_sockets, 1);
    assert_eq!(usage.messages_transmitted, 2);
    assert_eq!(usage.messages_received, 3);
    assert_eq!(usage.operations["bindRequest"], 1);
    assert_eq!(usage.operations["searchRequest"], 1);
    assert!(usage.bytes_received > 0);
    assert!(usage.to_string().contains("searchRequest: 1"));
}

#[test]
fn usage_is_off_by_default() {
    let server = FakeServer::start(Script::default());
    let ldap = LdapConn::new(&server.url).unwrap();
    assert!(ldap.usage().is_none());
}

#[test]
fn send_on_closed_connection() {
    let server = FakeServer::start(Script::default());
    let mut ldap =
        LdapConn::from_server(Server::new(&server.url).unwrap(), LdapConnSettings::new()).unwrap();
    let err = ldap
        .send(Request::simple_bind("cn=admin,dc=example", "secret"))
        .unwrap_err();
    assert!(matches!(err, LdapError::SocketNotOpen(_)));
}

#[test]
fn abandoned_responses_are_discarded() {
    let server = FakeServer::start(Script {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let mut ldap = LdapConn::new(&server.url).unwrap();
    let req = Request::search(
        "dc=example",
        Scope::Base,
        "(objectClass=*)",
        &["cn"],
        SearchOptions::new(),
    )
    .unwrap();
    let id = ldap.send(req).unwrap();
    ldap.abandon(id).unwrap();
    ldap.simple_bind("cn=admin,dc=example", "secret")
        .unwrap()
        .success()
        .unwrap();
    assert!(matches!(
        ldap.get_response(id),
        Err(LdapError::NotOutstanding(_))
    ));
    ldap.unbind().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(Stats::get(&server.stats.unbinds), 1);
}
