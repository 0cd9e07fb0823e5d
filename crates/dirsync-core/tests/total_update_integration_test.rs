//! Online initialization of a directory server from another one
//!
//! DS1 holds data, DS2 starts empty. Both attach to the same relay; DS2 is
//! flagged with a bad generation ID until it imports from DS1.

use dirsync_core::backend::{Backend, Dn, Entry, MemoryBackend, ResultCode};
use dirsync_core::monitor::{DomainHealthCheck, DomainMonitor, HealthCheck, HealthStatus};
use dirsync_core::protocol::{
    InitializeTargetMsg, PROTOCOL_VERSION, ReplicationMessage, ServerKind, StartMsg,
};
use dirsync_core::registry::DomainRegistry;
use dirsync_core::server_state::{EMPTY_BACKEND_GENERATION_ID, ServerState};
use dirsync_core::session::{Session, initiate_handshake};
use dirsync_core::testing::{
    TestContext, add_entry_request, base_entry, domain_config, start_domain, start_relay,
    wait_until,
};
use dirsync_core::{
    Error, InitializeTargetTask, InitializeTask, ReplicationDomain, ServerStatus, ServerTarget,
    TaskState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(15);

fn suffix() -> Dn {
    Dn::parse("dc=example,dc=com").unwrap()
}

fn person(base: &Dn, cn: &str) -> Entry {
    Entry::new(Dn::parse(&format!("cn={},{}", cn, base)).unwrap())
        .with_attribute("objectclass", "person")
        .with_attribute("cn", cn)
        .with_attribute("sn", cn)
}

fn populated_backend(base: &Dn) -> Arc<MemoryBackend> {
    let mut entries = vec![base_entry(base)];
    for cn in ["ivan", "judy", "mallory", "niaj", "olivia"] {
        entries.push(person(base, cn));
    }
    Arc::new(MemoryBackend::with_entries(entries))
}

fn sees(domain: &ReplicationDomain, id: i32) -> bool {
    domain.connected_dss().contains(&id)
}

/// Directory server played by hand over a raw protocol session
async fn attach_raw(
    relay: std::net::SocketAddr,
    base: &Dn,
    server_id: i32,
    generation_id: i64,
) -> Session {
    let stream = TcpStream::connect(relay).await.unwrap();
    let session = Session::from_tcp(stream, CancellationToken::new()).unwrap();
    let start = StartMsg {
        kind: ServerKind::Directory,
        protocol_version: PROTOCOL_VERSION,
        base_dn: base.clone(),
        server_id,
        generation_id,
        group_id: 1,
        window_size: 100,
        heartbeat_interval_ms: 60_000,
        server_state: ServerState::new(),
    };
    initiate_handshake(&session, start, ServerStatus::Normal)
        .await
        .unwrap();
    session
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initialize_empty_server_online() {
    let ctx = TestContext::new();
    let base = suffix();
    let relay = start_relay(&ctx, 3, &[]).await.unwrap();
    let relays = [relay.local_addr()];

    let ds1 = start_domain(domain_config(&base, 1, &relays), populated_backend(&base)).unwrap();
    assert_ne!(ds1.generation_id(), EMPTY_BACKEND_GENERATION_ID);
    assert!(wait_until(TIMEOUT, || {
        let ok = relay
            .domain(&base)
            .is_some_and(|d| d.generation_id() == Some(ds1.generation_id()));
        async move { ok }
    })
    .await);

    let backend2 = Arc::new(MemoryBackend::new());
    let ds2 = start_domain(domain_config(&base, 2, &relays), backend2.clone()).unwrap();
    assert_eq!(ds2.generation_id(), EMPTY_BACKEND_GENERATION_ID);
    assert!(wait_until(TIMEOUT, || {
        let ok = sees(&ds2, 1) && ds2.status() == ServerStatus::BadGenerationId;
        async move { ok }
    })
    .await);
    assert_eq!(
        DomainHealthCheck::new(ds2.clone()).check(),
        HealthStatus::Unhealthy
    );

    let registry = DomainRegistry::new();
    registry.register(ds2.clone()).unwrap();
    let task = InitializeTask::new("dc=example,dc=com", ServerTarget::Server(1))
        .start(&registry)
        .await
        .unwrap();
    let progress = task.wait(TIMEOUT).await;
    assert_eq!(progress.state, TaskState::CompletedSuccessfully, "{:?}", progress.log_messages);
    assert_eq!(progress.result_code, Some(ResultCode::Success));
    assert!(progress.completion_time.is_some());
    assert_eq!(progress.entries_done, 6);
    assert_eq!(progress.entries_left, 0);

    assert_eq!(
        backend2.count_entries(&base).unwrap(),
        ds1.backend().count_entries(&base).unwrap()
    );
    let judy = Dn::parse("cn=judy,dc=example,dc=com").unwrap();
    assert!(backend2.get_entry(&judy).unwrap().is_some());
    assert_eq!(ds2.generation_id(), ds1.generation_id());
    assert!(!backend2.is_inconsistent());
    assert_eq!(ds2.stats().imports, 1);
    assert!(wait_until(TIMEOUT, || {
        let ok = ds1.stats().exports == 1;
        async move { ok }
    })
    .await);

    // Reconnected with the adopted generation ID, updates flow again
    assert!(wait_until(TIMEOUT, || {
        let ok = ds2.status() == ServerStatus::Normal && ds2.is_connected();
        async move { ok }
    })
    .await);
    let csn = ds1
        .process_local(add_entry_request(&base, "peggy").unwrap())
        .await
        .unwrap()
        .csn
        .unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = ds2.server_state().cover(&csn);
        async move { ok }
    })
    .await);
    let peggy = Dn::parse("cn=peggy,dc=example,dc=com").unwrap();
    assert!(backend2.get_entry(&peggy).unwrap().is_some());

    let snapshot = DomainMonitor::capture(&ds2);
    assert_eq!(snapshot.status, ServerStatus::Normal);
    assert!(snapshot.total_update.is_none());
    assert_eq!(snapshot.connected_rs, Some(3));

    ds1.stop();
    ds2.stop();
    relay.stop();
}

/// Importer played by hand over a raw session
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_export_to_protocol_level_importer() {
    let ctx = TestContext::new();
    let base = suffix();
    let relay = start_relay(&ctx, 3, &[]).await.unwrap();
    let ds1 = start_domain(
        domain_config(&base, 1, &[relay.local_addr()]),
        populated_backend(&base),
    )
    .unwrap();
    ds1.broker().wait_connected(TIMEOUT).await.unwrap();

    let session = attach_raw(relay.local_addr(), &base, 2, EMPTY_BACKEND_GENERATION_ID).await;
    assert!(wait_until(TIMEOUT, || {
        let ok = sees(&ds1, 2);
        async move { ok }
    })
    .await);

    // Small window: the exporter has to wait for our acks
    session
        .send(&ReplicationMessage::InitializeRequest {
            base_dn: base.clone(),
            sender: 2,
            destination: ServerTarget::Server(1),
            init_window: 2,
        })
        .await
        .unwrap();

    let mut announced = None;
    let mut received = Vec::new();
    let done = tokio::time::timeout(TIMEOUT, async {
        loop {
            match session.recv().await.unwrap() {
                ReplicationMessage::InitializeTarget(msg) => announced = Some(msg),
                ReplicationMessage::Entry { sender, seq, ldif, .. } => {
                    assert_eq!(sender, 1);
                    assert_eq!(seq, received.len() as u64 + 1);
                    received.push(Entry::from_ldif(std::str::from_utf8(&ldif).unwrap()).unwrap());
                    session
                        .send(&ReplicationMessage::InitializeRcvAck {
                            sender: 2,
                            destination: ServerTarget::Server(1),
                            num_ack: seq,
                        })
                        .await
                        .unwrap();
                }
                ReplicationMessage::Done { sender, .. } => {
                    assert_eq!(sender, 1);
                    break;
                }
                ReplicationMessage::Error { details, .. } => panic!("export failed: {}", details),
                _ => {}
            }
        }
    })
    .await;
    assert!(done.is_ok(), "export did not finish");

    let announced = announced.expect("no InitializeTarget before the entries");
    assert_eq!(announced.sender, 1);
    assert_eq!(announced.requestor, 2);
    assert_eq!(announced.init_window, 2);
    assert_eq!(announced.generation_id, ds1.generation_id());
    assert_eq!(announced.entry_count, 6);
    assert_eq!(received.len(), 6);
    assert_eq!(received[0].dn, base);
    assert!(wait_until(TIMEOUT, || {
        let ok = ds1.stats().exports == 1 && !ds1.ie_running();
        async move { ok }
    })
    .await);

    session.close();
    ds1.stop();
    relay.stop();
}

/// Exporter played by hand, announcing more entries than it sends
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_import_counts_entries_actually_received() {
    let ctx = TestContext::new();
    let base = suffix();
    let relay = start_relay(&ctx, 3, &[]).await.unwrap();
    let exporter_generation = 0x5eed;
    let exporter = attach_raw(relay.local_addr(), &base, 1, exporter_generation).await;
    assert!(wait_until(TIMEOUT, || {
        let ok = relay
            .domain(&base)
            .is_some_and(|d| d.generation_id() == Some(exporter_generation));
        async move { ok }
    })
    .await);

    let backend2 = Arc::new(MemoryBackend::new());
    let ds2 = start_domain(domain_config(&base, 2, &[relay.local_addr()]), backend2.clone())
        .unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = sees(&ds2, 1);
        async move { ok }
    })
    .await);

    let registry = DomainRegistry::new();
    registry.register(ds2.clone()).unwrap();
    let task = InitializeTask::new("dc=example,dc=com", ServerTarget::Server(1))
        .start(&registry)
        .await
        .unwrap();

    let requested = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let ReplicationMessage::InitializeRequest { sender, .. } =
                exporter.recv().await.unwrap()
            {
                return sender;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(requested, 2);

    let entries = [base_entry(&base), person(&base, "rupert"), person(&base, "sybil")];
    let announce = InitializeTargetMsg {
        base_dn: base.clone(),
        sender: 1,
        destination: ServerTarget::Server(2),
        requestor: 2,
        entry_count: 10,
        init_window: 100,
        generation_id: exporter_generation,
        server_state: ServerState::new(),
    };
    exporter
        .send(&ReplicationMessage::InitializeTarget(announce))
        .await
        .unwrap();
    for (index, entry) in entries.iter().enumerate() {
        exporter
            .send(&ReplicationMessage::Entry {
                sender: 1,
                destination: ServerTarget::Server(2),
                seq: index as u64 + 1,
                ldif: entry.to_ldif().into_bytes(),
            })
            .await
            .unwrap();
    }
    exporter
        .send(&ReplicationMessage::Done {
            sender: 1,
            destination: ServerTarget::Server(2),
        })
        .await
        .unwrap();

    let progress = task.wait(TIMEOUT).await;
    assert_eq!(progress.state, TaskState::CompletedSuccessfully, "{:?}", progress.log_messages);
    assert_eq!(progress.entries_done, 3);
    assert_eq!(progress.entries_left, 0);
    assert_eq!(backend2.count_entries(&base).unwrap(), 3);
    assert_eq!(ds2.generation_id(), exporter_generation);

    exporter.close();
    ds2.stop();
    relay.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_push_initialization_to_all_servers() {
    let ctx = TestContext::new();
    let base = suffix();
    let relay = start_relay(&ctx, 3, &[]).await.unwrap();
    let relays = [relay.local_addr()];

    let ds1 = start_domain(domain_config(&base, 1, &relays), populated_backend(&base)).unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = relay
            .domain(&base)
            .is_some_and(|d| d.generation_id().is_some());
        async move { ok }
    })
    .await);
    let backend2 = Arc::new(MemoryBackend::new());
    let ds2 = start_domain(domain_config(&base, 2, &relays), backend2.clone()).unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = sees(&ds1, 2) && sees(&ds2, 1);
        async move { ok }
    })
    .await);

    let registry = DomainRegistry::new();
    registry.register(ds1.clone()).unwrap();
    let task = InitializeTargetTask::new("dc=example,dc=com", ServerTarget::All)
        .start(&registry)
        .await
        .unwrap();
    let progress = task.wait(TIMEOUT).await;
    assert_eq!(progress.state, TaskState::CompletedSuccessfully, "{:?}", progress.log_messages);
    assert_eq!(progress.entries_done, 6);
    assert_eq!(progress.entries_left, 0);

    assert!(wait_until(TIMEOUT, || {
        let ok = ds2.stats().imports == 1;
        async move { ok }
    })
    .await);
    assert_eq!(
        backend2.count_entries(&base).unwrap(),
        ds1.backend().count_entries(&base).unwrap()
    );
    assert_eq!(ds2.generation_id(), ds1.generation_id());

    ds1.stop();
    ds2.stop();
    relay.stop();
}

#[tokio::test]
async fn test_invalid_initialize_requests_fail_at_once() {
    let base = suffix();
    let ds1 = ReplicationDomain::new(
        domain_config(&base, 1, &["127.0.0.1:1".parse().unwrap()]),
        populated_backend(&base),
    )
    .unwrap();
    let registry = DomainRegistry::new();
    registry.register(ds1.clone()).unwrap();

    let own = InitializeTask::new("dc=example,dc=com", ServerTarget::Server(1))
        .start(&registry)
        .await
        .unwrap_err();
    assert!(matches!(own, Error::InvalidImportSource(1)));

    let zero = InitializeTask::new("dc=example,dc=com", ServerTarget::Server(0))
        .start(&registry)
        .await
        .unwrap_err();
    assert!(matches!(zero, Error::InvalidImportSource(0)));

    let absent = InitializeTask::new("dc=example,dc=com", ServerTarget::Server(42))
        .start(&registry)
        .await
        .unwrap_err();
    assert!(matches!(absent, Error::NoReachablePeer { server_id: 42, .. }));

    let nobody = InitializeTargetTask::new("dc=example,dc=com", ServerTarget::All)
        .start(&registry)
        .await
        .unwrap_err();
    assert!(matches!(nobody, Error::NoRemotes(_)));

    let unknown = InitializeTask::new("dc=other,dc=com", ServerTarget::Server(2))
        .start(&registry)
        .await
        .unwrap_err();
    assert!(matches!(unknown, Error::NoMatchingDomain(_)));

    // Nothing was started
    assert!(!ds1.ie_running());
    assert!(ds1.total_update().is_none());
}
