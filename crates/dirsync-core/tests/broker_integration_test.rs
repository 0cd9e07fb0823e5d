//! Broker behaviour without a reachable relay and across relay restarts

use dirsync_core::backend::{Backend, Dn, MemoryBackend, ResultCode};
use dirsync_core::broker::ReceiveOutcome;
use dirsync_core::monitor::{DomainHealthCheck, HealthCheck, HealthStatus};
use dirsync_core::testing::{
    TestContext, add_entry_request, base_entry, domain_config, reserve_addrs, start_domain,
    start_relay, start_relay_at, wait_until,
};
use dirsync_core::{Error, ReplicationDomain, ServerStatus};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn suffix() -> Dn {
    Dn::parse("dc=example,dc=com").unwrap()
}

fn seeded_backend(base: &Dn) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_entries([base_entry(base)]))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_relay_times_out_and_keeps_local_writes() {
    let base = suffix();
    // Reserved then released: nothing listens there
    let nowhere = reserve_addrs(1);
    let config = domain_config(&base, 11, &nowhere).with_publish_timeout(Duration::from_millis(200));
    let ds11 = start_domain(config, seeded_backend(&base)).unwrap();

    let err = ds11
        .broker()
        .wait_connected(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{}", err);
    assert!(!ds11.is_connected());
    assert_eq!(ds11.status(), ServerStatus::NotConnected);
    assert_eq!(
        DomainHealthCheck::new(ds11.clone()).check(),
        HealthStatus::Degraded
    );

    // Applied locally, kept for resend
    let outcome = ds11
        .process_local(add_entry_request(&base, "trent").unwrap())
        .await
        .unwrap();
    assert_eq!(outcome.code, ResultCode::Success);
    assert!(outcome.csn.is_some());
    assert_eq!(ds11.own_log().len(), 1);

    ds11.stop();
    assert!(ds11.broker().is_stopped());
    assert!(matches!(
        ds11.broker().receive(Duration::from_millis(50)).await,
        ReceiveOutcome::Closed
    ));
    let after_stop = ds11
        .process_local(add_entry_request(&base, "victor").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(after_stop, Error::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unpublished_changes_are_resent_when_relay_appears() {
    let ctx = TestContext::new();
    let base = suffix();
    let addr = reserve_addrs(1)[0];
    let config = domain_config(&base, 11, &[addr]).with_publish_timeout(Duration::from_millis(200));
    let ds11 = start_domain(config, seeded_backend(&base)).unwrap();

    let csn = ds11
        .process_local(add_entry_request(&base, "walter").unwrap())
        .await
        .unwrap()
        .csn
        .unwrap();

    let relay = start_relay_at(&ctx, 1, addr, &[]).await.unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = relay
            .domain(&base)
            .is_some_and(|d| d.server_state().cover(&csn));
        async move { ok }
    })
    .await);
    assert!(ds11.is_connected());
    assert!(ds11.broker_stats().resent_updates >= 1);

    ds11.stop();
    relay.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broker_reconnects_after_relay_restart() {
    let ctx = TestContext::new();
    let base = suffix();
    let relay = start_relay(&ctx, 1, &[]).await.unwrap();
    let addr = relay.local_addr();
    let ds11: Arc<ReplicationDomain> =
        start_domain(domain_config(&base, 11, &[addr]), seeded_backend(&base)).unwrap();
    ds11.broker().wait_connected(TIMEOUT).await.unwrap();
    let sessions = ds11.broker_stats().sessions;

    relay.stop();
    assert!(wait_until(TIMEOUT, || {
        let ok = !ds11.is_connected();
        async move { ok }
    })
    .await);

    drop(relay);

    // The old listener is released asynchronously
    let mut attempts = 0;
    let relay = loop {
        match start_relay_at(&ctx, 1, addr, &[]).await {
            Ok(relay) => break relay,
            Err(e) if attempts < 50 => {
                attempts += 1;
                tracing::debug!("Relay restart failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("relay did not restart: {}", e),
        }
    };
    assert!(wait_until(TIMEOUT, || {
        let ok = ds11.is_connected() && ds11.broker_stats().sessions > sessions;
        async move { ok }
    })
    .await);
    assert!(ds11.broker_stats().reconnects >= 1);
    assert_eq!(relay.domain(&base).unwrap().connected_dss(), vec![11]);

    let entry = Dn::parse("cn=yvonne,dc=example,dc=com").unwrap();
    ds11.process_local(add_entry_request(&base, "yvonne").unwrap())
        .await
        .unwrap();
    assert!(ds11.backend().get_entry(&entry).unwrap().is_some());

    ds11.stop();
    relay.stop();
}
