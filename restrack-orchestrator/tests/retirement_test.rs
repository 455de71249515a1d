// Deletion orchestration against in-memory gateways. No database needed.
mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use restrack_common::payload::LeaseDetails;
use restrack_common::{ResourceKind, ResourcePayload, Site, SiteResourceId, TrackerError};
use restrack_orchestrator::provider_manager::SiteGateways;
use restrack_orchestrator::reconciliation;
use restrack_orchestrator::retirement::Selection;
use restrack_orchestrator::terminator::retire;
use restrack_providers::inventory::{Port, PortFilter, DHCP_OWNER, ROUTER_INTERFACE_OWNER};
use restrack_providers::mock::{GatewayCall, MockGateway};
use std::sync::Arc;

fn cutoff() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

fn created(hours_before_cutoff: i64) -> chrono::DateTime<Utc> {
    cutoff() - Duration::hours(hours_before_cutoff)
}

/// Live gateway holding the same resources as the selection.
fn gateway_for(site: Site, selection: &Selection) -> Arc<MockGateway> {
    let gw = MockGateway::new(site);
    for resources in selection.by_kind.values() {
        for r in resources.iter().filter(|r| r.site == site) {
            gw.put(restrack_providers::inventory::DiscoveredResource {
                resource_id: r.resource_id.clone(),
                resource_name: r.resource_name.clone(),
                status: r.status.clone(),
                created_time: r.created_time,
                updated_time: r.updated_time,
                payload: r.payload.clone(),
            });
        }
    }
    Arc::new(gw)
}

fn gateways(list: &[Arc<MockGateway>]) -> SiteGateways {
    let mut out = SiteGateways::new();
    for gw in list {
        out.insert(gw.clone()).unwrap();
    }
    out
}

fn port(id: &str, network: &str, device: &str, owner: &str, subnets: &[&str]) -> Port {
    Port {
        port_id: id.to_string(),
        network_id: Some(network.to_string()),
        device_id: Some(device.to_string()),
        device_owner: Some(owner.to_string()),
        subnet_ids: subnets.iter().map(|s| s.to_string()).collect(),
    }
}

#[tokio::test]
async fn dry_run_touches_neither_gateway_nor_ledger() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked(Site::ChiUc, ResourceKind::Server, "srv-1", created(48)));
    selection.push(tracked(Site::ChiUc, ResourceKind::Network, "net-1", created(30)));
    let gw = gateway_for(Site::ChiUc, &selection);
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, true, &gateways(&[gw.clone()]), &ledger).await;

    assert!(outcome.dry_run);
    assert!(gw.calls().is_empty());
    assert!(ledger.calls().is_empty());
    assert_eq!(outcome.confirmed_count(), 0);
    let preview = outcome.preview.expect("dry run renders a preview");
    assert!(preview.contains("name-srv-1"));
    assert!(preview.contains("name-net-1"));
    assert_eq!(gw.remaining(ResourceKind::Server), vec!["srv-1".to_string()]);
}

#[tokio::test]
async fn one_failing_server_does_not_block_the_others() {
    let mut selection = Selection::new(cutoff());
    for i in 1..=5 {
        selection.push(tracked(
            Site::ChiTacc,
            ResourceKind::Server,
            &format!("srv-{}", i),
            created(100 - i),
        ));
    }
    let gw = gateway_for(Site::ChiTacc, &selection);
    gw.fail_on("srv-3");
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert_eq!(
        outcome.confirmed_ids(ResourceKind::Server),
        vec!["srv-1", "srv-2", "srv-4", "srv-5"]
    );
    assert_eq!(outcome.failed_ids(ResourceKind::Server), vec!["srv-3"]);
    assert!(!outcome.is_clean());

    // Exactly one bookkeeping call, covering only the confirmed ids.
    let calls = ledger.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, ResourceKind::Server);
    let recorded: Vec<&str> = calls[0].1.iter().map(|k| k.resource_id.as_str()).collect();
    assert_eq!(recorded, vec!["srv-1", "srv-2", "srv-4", "srv-5"]);
    assert_eq!(gw.remaining(ResourceKind::Server), vec!["srv-3".to_string()]);
}

#[tokio::test]
async fn deletion_follows_dependency_order() {
    let site = Site::KvmTacc;
    let mut selection = Selection::new(cutoff());
    selection.push(tracked(site, ResourceKind::GpuLease, "lease-1", created(10)));
    selection.push(tracked(site, ResourceKind::FloatingIp, "fip-1", created(10)));
    selection.push(tracked(site, ResourceKind::Network, "net-1", created(10)));
    selection.push(tracked(site, ResourceKind::Subnet, "sub-1", created(10)));
    selection.push(tracked_with(site, "rtr-1", router_with_gateway(), created(10)));
    selection.push(tracked_with(
        site,
        "srv-1",
        server_with_floating_ip("203.0.113.5"),
        created(10),
    ));

    let gw = gateway_for(site, &selection);
    gw.add_floating_address("203.0.113.5");
    gw.add_port(port("port-rif", "net-1", "rtr-1", ROUTER_INTERFACE_OWNER, &["sub-1"]));
    gw.add_port(port("port-dhcp", "net-1", "dhcp-agent", DHCP_OWNER, &["sub-1"]));
    gw.add_port(port("port-vm", "net-1", "srv-other", "compute:nova", &["sub-1"]));
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert!(outcome.is_clean(), "unexpected failures: {:?}", outcome.failed);
    assert_eq!(
        gw.mutation_calls(),
        vec![
            GatewayCall::ReleaseFloatingIp("203.0.113.5".to_string()),
            GatewayCall::Delete(ResourceKind::Server, "srv-1".to_string()),
            GatewayCall::ClearGateway("rtr-1".to_string()),
            GatewayCall::DetachInterface {
                router_id: "rtr-1".to_string(),
                subnet_id: "sub-1".to_string()
            },
            GatewayCall::Delete(ResourceKind::Router, "rtr-1".to_string()),
            GatewayCall::DeletePort("port-vm".to_string()),
            GatewayCall::Delete(ResourceKind::Subnet, "sub-1".to_string()),
            GatewayCall::Delete(ResourceKind::Network, "net-1".to_string()),
            GatewayCall::Delete(ResourceKind::FloatingIp, "fip-1".to_string()),
            GatewayCall::Delete(ResourceKind::GpuLease, "lease-1".to_string()),
        ]
    );
    assert!(gw
        .calls()
        .contains(&GatewayCall::ListPorts(PortFilter::Network("net-1".to_string()))));
    // dhcp ports go away with their network.
    assert_eq!(gw.remaining_ports(), vec!["port-dhcp".to_string()]);

    let kinds: Vec<ResourceKind> = ledger.calls().into_iter().map(|(k, _)| k).collect();
    assert_eq!(kinds, ResourceKind::ALL.to_vec());
}

#[tokio::test]
async fn router_cleanup_failures_do_not_prevent_the_delete() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked_with(Site::ChiUc, "rtr-1", router_with_gateway(), created(5)));
    let gw = gateway_for(Site::ChiUc, &selection);
    gw.add_port(port("port-rif", "net-x", "rtr-1", ROUTER_INTERFACE_OWNER, &["sub-x"]));
    gw.fail_on("gateway:rtr-1");
    gw.fail_on("sub-x");
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert_eq!(outcome.confirmed_ids(ResourceKind::Router), vec!["rtr-1"]);
    let calls = gw.mutation_calls();
    assert_eq!(
        calls.last(),
        Some(&GatewayCall::Delete(ResourceKind::Router, "rtr-1".to_string()))
    );
    assert!(calls.contains(&GatewayCall::ClearGateway("rtr-1".to_string())));
}

#[tokio::test]
async fn router_without_external_gateway_is_only_detached() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked(Site::ChiTacc, ResourceKind::Router, "rtr-2", created(5)));
    let gw = gateway_for(Site::ChiTacc, &selection);
    gw.add_port(port("port-rif", "net-y", "rtr-2", ROUTER_INTERFACE_OWNER, &["sub-y"]));
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert!(outcome.is_clean(), "unexpected failures: {:?}", outcome.failed);
    assert_eq!(
        gw.mutation_calls(),
        vec![
            GatewayCall::DetachInterface {
                router_id: "rtr-2".to_string(),
                subnet_id: "sub-y".to_string()
            },
            GatewayCall::Delete(ResourceKind::Router, "rtr-2".to_string()),
        ]
    );
}

#[tokio::test]
async fn failed_router_delete_is_excluded_from_bookkeeping() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked(Site::ChiUc, ResourceKind::Router, "rtr-1", created(5)));
    let gw = gateway_for(Site::ChiUc, &selection);
    gw.fail_on("rtr-1");
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert!(outcome.confirmed_ids(ResourceKind::Router).is_empty());
    assert_eq!(outcome.failed_ids(ResourceKind::Router), vec!["rtr-1"]);
    assert!(ledger.calls().is_empty());
}

#[tokio::test]
async fn unreleasable_floating_ip_does_not_block_server_delete() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked_with(
        Site::ChiUc,
        "srv-1",
        server_with_floating_ip("198.51.100.9"),
        created(5),
    ));
    let gw = gateway_for(Site::ChiUc, &selection);
    gw.fail_on("198.51.100.9");
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert_eq!(outcome.confirmed_ids(ResourceKind::Server), vec!["srv-1"]);
    assert!(outcome.is_clean());
}

#[tokio::test]
async fn resources_at_unreachable_sites_are_reported_failed() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked(Site::ChiUc, ResourceKind::Server, "srv-uc", created(5)));
    selection.push(tracked(Site::KvmTacc, ResourceKind::Server, "srv-kvm", created(6)));
    let uc = gateway_for(Site::ChiUc, &selection);
    let ledger = RecordingLedger::default();

    let outcome = retire(&selection, false, &gateways(&[uc.clone()]), &ledger).await;

    assert_eq!(outcome.confirmed_ids(ResourceKind::Server), vec!["srv-uc"]);
    let failed = &outcome.failed[&ResourceKind::Server];
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].resource, SiteResourceId::new(Site::KvmTacc, "srv-kvm"));
    assert!(failed[0].reason.contains("KVM@TACC"));
}

#[tokio::test]
async fn bookkeeping_failure_is_reported_but_deletions_stand() {
    let mut selection = Selection::new(cutoff());
    selection.push(tracked(Site::ChiUc, ResourceKind::Server, "srv-1", created(5)));
    selection.push(tracked_with(
        Site::ChiUc,
        "lease-1",
        ResourcePayload::GpuLease(LeaseDetails::default()),
        created(5),
    ));
    let gw = gateway_for(Site::ChiUc, &selection);
    let ledger = RecordingLedger::default();
    ledger.fail_for(ResourceKind::Server);

    let outcome = retire(&selection, false, &gateways(&[gw.clone()]), &ledger).await;

    assert_eq!(outcome.confirmed_ids(ResourceKind::Server), vec!["srv-1"]);
    assert_eq!(outcome.confirmed_ids(ResourceKind::GpuLease), vec!["lease-1"]);
    assert_eq!(outcome.bookkeeping_errors.len(), 1);
    assert_eq!(outcome.bookkeeping_errors[0].0, ResourceKind::Server);
    assert!(!outcome.is_clean());
    assert_eq!(ledger.calls().len(), 2);
}

#[tokio::test]
async fn listing_failure_aborts_before_any_write() {
    let gw = MockGateway::new(Site::ChiTacc);
    gw.put(discovered(ResourceKind::Server, "srv-1", "srv", None));
    gw.fail_listing(ResourceKind::Router);

    let err = reconciliation::fetch_snapshot(&gw, &ResourceKind::ALL)
        .await
        .unwrap_err();

    match err {
        TrackerError::Gateway { site, operation, .. } => {
            assert_eq!(site, Site::ChiTacc);
            assert_eq!(operation, "list routers");
        }
        other => panic!("expected a gateway error, got {:?}", other),
    }
    assert!(gw.mutation_calls().is_empty());
}

#[tokio::test]
async fn unsupported_kinds_are_skipped_not_emptied() {
    let gw = MockGateway::new(Site::KvmTacc);
    gw.mark_unsupported(ResourceKind::GpuLease);

    let snapshot = reconciliation::fetch_snapshot(&gw, &ResourceKind::ALL)
        .await
        .unwrap();

    assert_eq!(snapshot.skipped, vec![ResourceKind::GpuLease]);
    assert!(snapshot
        .listings
        .iter()
        .all(|(kind, _)| *kind != ResourceKind::GpuLease));
    assert!(!gw.calls().contains(&GatewayCall::List(ResourceKind::GpuLease)));
}
