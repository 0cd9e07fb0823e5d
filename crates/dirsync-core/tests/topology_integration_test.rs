//! Relay meshes
//!
//! Every relay connects to every other one; directory servers attached to
//! different relays see each other in the topology and exchange changes.
//! Each relay reports the directory servers of its peers as connected.

use dirsync_core::backend::{Backend, Dn, MemoryBackend};
use dirsync_core::monitor::{HealthCheck, HealthStatus, RelayHealthCheck, ReplicationServerMonitor};
use dirsync_core::testing::{
    TestContext, add_entry_request, base_entry, domain_config, reserve_addrs, start_domain,
    start_relay_at, wait_until,
};
use dirsync_core::{ReplicationDomain, ReplicationServer};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(15);

fn suffix() -> Dn {
    Dn::parse("dc=example,dc=com").unwrap()
}

fn seeded_backend(base: &Dn) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_entries([base_entry(base)]))
}

fn sees(domain: &ReplicationDomain, others: &[i32]) -> bool {
    let connected = domain.connected_dss();
    others.iter().all(|id| connected.contains(id))
}

fn relays_report(relays: &[Arc<ReplicationServer>], base: &Dn, expected: &[i32]) -> bool {
    relays
        .iter()
        .all(|r| r.domain(base).is_some_and(|d| d.connected_dss() == expected))
}

async fn full_mesh(ctx: &TestContext) -> Vec<Arc<ReplicationServer>> {
    let addrs = reserve_addrs(3);
    let mut relays = Vec::new();
    for (i, addr) in addrs.iter().enumerate() {
        let relay = start_relay_at(ctx, i as i32 + 1, *addr, &addrs).await.unwrap();
        relays.push(relay);
    }
    relays
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_changes_cross_the_relay_mesh() {
    let ctx = TestContext::new();
    let base = suffix();
    let relays = full_mesh(&ctx).await;

    let domains: Vec<Arc<ReplicationDomain>> = relays
        .iter()
        .enumerate()
        .map(|(i, relay)| {
            let config = domain_config(&base, 11 + i as i32, &[relay.local_addr()]);
            start_domain(config, seeded_backend(&base)).unwrap()
        })
        .collect();

    // Each relay sees its two peers, each server the two remote ones
    assert!(wait_until(TIMEOUT, || {
        let ok = relays
            .iter()
            .all(|r| r.domain(&base).is_some_and(|d| d.connected_rss().len() == 2))
            && sees(&domains[0], &[12, 13])
            && sees(&domains[1], &[11, 13])
            && sees(&domains[2], &[11, 12]);
        async move { ok }
    })
    .await);

    let csn = domains[0]
        .process_local(add_entry_request(&base, "heidi").unwrap())
        .await
        .unwrap()
        .csn
        .unwrap();
    let heidi = Dn::parse("cn=heidi,dc=example,dc=com").unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = domains[1..]
            .iter()
            .all(|d| matches!(d.backend().get_entry(&heidi), Ok(Some(_))));
        async move { ok }
    })
    .await);

    // Stored once on every relay, never bounced back to the origin
    for relay in &relays {
        let domain = relay.domain(&base).unwrap();
        assert_eq!(domain.changelog().newest_csn(11), Some(csn));
    }
    assert_eq!(domains[0].stats().replayed_updates, 0);

    assert!(wait_until(TIMEOUT, || {
        let ok = relays_report(&relays, &base, &[11, 12, 13]);
        async move { ok }
    })
    .await);
    let snapshot = ReplicationServerMonitor::capture(&relays[0]);
    assert_eq!(snapshot.server_id, 1);
    assert_eq!(snapshot.domains.len(), 1);
    assert_eq!(snapshot.domains[0].connected_dss, vec![11, 12, 13]);
    assert_eq!(snapshot.domains[0].local_dss, vec![11]);
    assert_eq!(snapshot.domains[0].connected_rss, vec![2, 3]);
    assert_eq!(
        RelayHealthCheck::new(relays[0].clone()).check(),
        HealthStatus::Healthy
    );

    for domain in &domains {
        domain.stop();
    }
    for relay in &relays {
        relay.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_server_leaves_remote_topologies() {
    let ctx = TestContext::new();
    let base = suffix();
    let relays = full_mesh(&ctx).await;

    let ds11 = start_domain(
        domain_config(&base, 11, &[relays[0].local_addr()]),
        seeded_backend(&base),
    )
    .unwrap();
    let ds13 = start_domain(
        domain_config(&base, 13, &[relays[2].local_addr()]),
        seeded_backend(&base),
    )
    .unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = sees(&ds11, &[13]) && sees(&ds13, &[11]);
        async move { ok }
    })
    .await);
    assert!(wait_until(TIMEOUT, || {
        let ok = relays_report(&relays, &base, &[11, 13]);
        async move { ok }
    })
    .await);

    ds13.stop();
    assert!(wait_until(TIMEOUT, || {
        let ok = !ds11.connected_dss().contains(&13) && relays_report(&relays, &base, &[11]);
        async move { ok }
    })
    .await);
    assert!(relays[2].domain(&base).unwrap().local_dss().is_empty());
    assert_eq!(relays[0].domain(&base).unwrap().local_dss(), vec![11]);

    ds11.stop();
    for relay in &relays {
        relay.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_chain_reports_servers_of_the_middle_relay() {
    let ctx = TestContext::new();
    let base = suffix();
    let addrs = reserve_addrs(3);
    // RS1 - RS2 - RS3, only the middle relay dials out
    let rs1 = start_relay_at(&ctx, 1, addrs[0], &[]).await.unwrap();
    let rs3 = start_relay_at(&ctx, 3, addrs[2], &[]).await.unwrap();
    let rs2 = start_relay_at(&ctx, 2, addrs[1], &[addrs[0], addrs[2]]).await.unwrap();
    let relays = vec![rs1.clone(), rs2.clone(), rs3.clone()];

    let ds11 = start_domain(domain_config(&base, 11, &[addrs[1]]), seeded_backend(&base)).unwrap();
    assert!(wait_until(TIMEOUT, || {
        let ok = rs2.domain(&base).is_some_and(|d| d.connected_rss() == vec![1, 3])
            && relays_report(&relays, &base, &[11]);
        async move { ok }
    })
    .await);
    for outer in [&rs1, &rs3] {
        let snapshot = ReplicationServerMonitor::capture(outer);
        assert_eq!(snapshot.domains[0].connected_dss, vec![11]);
        assert!(snapshot.domains[0].local_dss.is_empty());
    }

    ds11.stop();
    assert!(wait_until(TIMEOUT, || {
        let ok = relays_report(&relays, &base, &[]);
        async move { ok }
    })
    .await);

    for relay in &relays {
        relay.stop();
    }
}
