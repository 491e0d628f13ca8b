mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{init_logging, FakeServer, Script, Stats};
use ldapcore::exop::STARTTLS_OID;
use ldapcore::{
    ClientStrategy, ErrorKind, LdapConn, LdapConnSettings, LdapError, PoolRegistry,
    PoolingStrategy, Request, ResponseType, Scope, SearchOptions, Server, ServerPool,
    WorkerState,
};

fn reusable(name: &str, size: usize) -> LdapConnSettings {
    LdapConnSettings::new()
        .set_strategy(ClientStrategy::Reusable)
        .set_pool_name(name)
        .set_pool_size(size)
        .set_restart_sleep(Duration::from_millis(10))
        .set_response_poll(Duration::from_millis(5))
        .set_response_timeout(Duration::from_secs(5))
}

fn search_req() -> Request {
    Request::search(
        "dc=example",
        Scope::Base,
        "(objectClass=*)",
        &["cn"],
        SearchOptions::new(),
    )
    .unwrap()
}

fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("ldap://127.0.0.1:{}", port)
}

fn search_ok(ldap: &mut LdapConn) {
    let (rs, _) = ldap
        .search("dc=example", Scope::Base, "(objectClass=*)", vec!["cn"])
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(rs.len(), 1);
}

#[test]
fn workers_run_concurrently() {
    init_logging();
    let server = FakeServer::start(Script {
        delay: Duration::from_millis(150),
        ..Default::default()
    });
    let mut ldap =
        LdapConn::from_server(Server::new(&server.url).unwrap(), reusable("concurrent", 3))
            .unwrap();
    ldap.open().unwrap();
    let pool = ldap.pool().unwrap().clone();
    assert!(pool.started());
    assert_eq!(pool.worker_states().len(), 3);
    let ids = (0..3)
        .map(|_| ldap.send(search_req()).unwrap())
        .collect::<Vec<_>>();
    for id in ids {
        let resp = ldap.get_response(id).unwrap().unwrap();
        assert_eq!(resp.result.rc, 0);
        assert_eq!(resp.entries.len(), 1);
    }
    assert!(Stats::get(&server.stats.max_active) >= 2);
    assert!(pool
        .worker_states()
        .iter()
        .all(|st| *st == WorkerState::Idle));
    ldap.close();
    assert!(!pool.started());
    assert!(pool.worker_states().is_empty());
}

#[test]
fn bind_is_answered_locally() {
    let server = FakeServer::start(Script::default());
    let mut ldap =
        LdapConn::from_server(Server::new(&server.url).unwrap(), reusable("bind", 1)).unwrap();
    let resp = ldap
        .simple_bind("cn=admin,dc=example", "secret")
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(resp.result.rtype, ResponseType::BindResponse);
    assert_eq!(resp.result.text, "<bogus Bind response>");
    assert!(ldap.is_bound());
    assert_eq!(Stats::get(&server.stats.binds), 0);
    ldap.search("dc=example", Scope::Base, "(objectClass=*)", vec!["cn"])
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(Stats::get(&server.stats.binds), 1);
}

#[test]
fn sentinel_ids() {
    let server = FakeServer::start(Script::default());
    let mut ldap =
        LdapConn::from_server(Server::new(&server.url).unwrap(), reusable("sentinels", 1))
            .unwrap();
    ldap.open().unwrap();
    assert_eq!(
        ldap.send(Request::simple_bind("cn=admin,dc=example", "secret"))
            .unwrap(),
        -1
    );
    let id = ldap.send(Request::Abandon(7)).unwrap();
    assert_eq!(id, -4);
    let resp = ldap.get_response(id).unwrap().unwrap();
    assert_eq!(resp.result.rtype, ResponseType::ExtendedResp);
    assert_eq!(resp.result.text, "<bogus StartTls response>");
    assert_eq!(resp.exop.name.as_deref(), Some(STARTTLS_OID));
    let id = ldap.send(Request::Unbind).unwrap();
    assert_eq!(id, -2);
    assert!(ldap.get_response(id).unwrap().is_none());
}

#[test]
fn send_before_open() {
    let server = FakeServer::start(Script::default());
    let mut ldap =
        LdapConn::from_server(Server::new(&server.url).unwrap(), reusable("unopened", 1))
            .unwrap();
    let err = ldap.send(search_req()).unwrap_err();
    assert!(matches!(err, LdapError::PoolNotStarted(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn empty_pool_name() {
    let server = FakeServer::start(Script::default());
    let err = LdapConn::from_server(Server::new(&server.url).unwrap(), reusable("", 1))
        .unwrap_err();
    assert!(matches!(err, LdapError::InvalidPoolName));
}

#[test]
fn response_timeout() {
    let server = FakeServer::start(Script {
        delay: Duration::from_millis(400),
        ..Default::default()
    });
    let settings = reusable("slow", 1).set_response_timeout(Duration::from_millis(50));
    let mut ldap = LdapConn::from_server(Server::new(&server.url).unwrap(), settings).unwrap();
    let err = ldap
        .search("dc=example", Scope::Base, "(objectClass=*)", vec!["cn"])
        .unwrap_err();
    assert!(matches!(err, LdapError::ResponseTimeout(_)));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn registry_shares_pools() {
    let server = FakeServer::start(Script::default());
    let registry = PoolRegistry::new();
    let settings = reusable("shared", 2).set_pool_registry(registry.clone());
    let mut first =
        LdapConn::from_server(Server::new(&server.url).unwrap(), settings.clone()).unwrap();
    let second = LdapConn::from_server(Server::new(&server.url).unwrap(), settings).unwrap();
    assert!(Arc::ptr_eq(first.pool().unwrap(), second.pool().unwrap()));
    assert_eq!(registry.names(), vec!["shared".to_owned()]);
    first.open().unwrap();
    assert!(registry.get("shared").unwrap().started());
    assert!(registry.remove("shared").is_some());
    assert!(registry.names().is_empty());
}

#[test]
fn queued_requests_share_the_workers() {
    let server = FakeServer::start(Script {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let mut ldap =
        LdapConn::from_server(Server::new(&server.url).unwrap(), reusable("throughput", 2))
            .unwrap();
    ldap.open().unwrap();
    let ids = (0..6)
        .map(|_| ldap.send(search_req()).unwrap())
        .collect::<Vec<_>>();
    for id in ids {
        let resp = ldap.get_response(id).unwrap().unwrap();
        assert_eq!(resp.result.rc, 0);
        assert_eq!(resp.entries.len(), 1);
    }
    assert_eq!(Stats::get(&server.stats.requests), 6);
    let max_active = Stats::get(&server.stats.max_active);
    assert!(max_active >= 1 && max_active <= 2);
}

#[test]
fn workers_retry_their_first_open() {
    let server = FakeServer::start(Script::default());
    let servers = ServerPool::new(
        vec![
            Server::new(&refused_url()).unwrap(),
            Server::new(&server.url).unwrap(),
        ],
        PoolingStrategy::RoundRobin,
    );
    let settings = reusable("retrying", 1).set_restart_tries(Some(3));
    let mut ldap = LdapConn::from_pool(servers, settings).unwrap();
    search_ok(&mut ldap);
    assert_eq!(Stats::get(&server.stats.accepted), 1);
}

#[test]
fn expired_connections_are_replaced() {
    let server = FakeServer::start(Script::default());
    let settings = reusable("lifetime", 1).set_pool_lifetime(Some(Duration::from_millis(50)));
    let mut ldap = LdapConn::from_server(Server::new(&server.url).unwrap(), settings).unwrap();
    search_ok(&mut ldap);
    assert_eq!(Stats::get(&server.stats.accepted), 1);
    thread::sleep(Duration::from_millis(150));
    search_ok(&mut ldap);
    assert_eq!(Stats::get(&server.stats.accepted), 2);
}

#[test]
fn idle_workers_send_keepalives() {
    let server = FakeServer::start(Script::default());
    let settings = reusable("keepalive", 1).set_pool_keepalive(Some(Duration::from_millis(30)));
    let mut ldap = LdapConn::from_server(Server::new(&server.url).unwrap(), settings).unwrap();
    search_ok(&mut ldap);
    thread::sleep(Duration::from_millis(200));
    assert!(Stats::get(&server.stats.abandons) >= 1);
    assert_eq!(Stats::get(&server.stats.accepted), 1);
}

#[test]
fn shared_pool_outlives_first_close() {
    let server = FakeServer::start(Script::default());
    let registry = PoolRegistry::new();
    let settings = reusable("held", 1).set_pool_registry(registry);
    let mut first =
        LdapConn::from_server(Server::new(&server.url).unwrap(), settings.clone()).unwrap();
    let mut second = LdapConn::from_server(Server::new(&server.url).unwrap(), settings).unwrap();
    first.open().unwrap();
    second.open().unwrap();
    let pool = second.pool().unwrap().clone();
    assert_eq!(pool.holders(), 2);
    first.close();
    assert_eq!(pool.holders(), 1);
    assert!(pool.started());
    search_ok(&mut second);
    second.close();
    assert_eq!(pool.holders(), 0);
    assert!(!pool.started());
}
