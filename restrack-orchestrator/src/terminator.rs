use async_trait::async_trait;
use chrono::Utc;
use restrack_common::{ResourceKind, ResourcePayload, Site, SiteResourceId, TrackedResource, TrackerError, TrackerResult};
use restrack_providers::inventory::PortFilter;
use restrack_providers::CloudGateway;
use sqlx::{Pool, Postgres};
use std::collections::BTreeMap;
use tracing::Instrument;
use uuid::Uuid;

use crate::inventory_store as store;
use crate::preview;
use crate::provider_manager::SiteGateways;
use crate::retirement::Selection;

/// Where confirmed deletions are written back.
#[async_trait]
pub trait DeletionLedger: Send + Sync {
    /// Flag every id as deleted by us, in a single statement for the kind.
    async fn confirm_deleted(&self, kind: ResourceKind, ids: &[SiteResourceId]) -> TrackerResult<u64>;
}

pub struct PgDeletionLedger {
    pool: Pool<Postgres>,
}

impl PgDeletionLedger {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeletionLedger for PgDeletionLedger {
    async fn confirm_deleted(&self, kind: ResourceKind, ids: &[SiteResourceId]) -> TrackerResult<u64> {
        let mut conn = self.pool.acquire().await?;
        store::confirm_deleted(&mut conn, kind, ids).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub resource: SiteResourceId,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RetirementOutcome {
    pub dry_run: bool,
    pub preview: Option<String>,
    /// Ids the provider confirmed deleted, per kind, in deletion order.
    pub confirmed: BTreeMap<ResourceKind, Vec<SiteResourceId>>,
    pub failed: BTreeMap<ResourceKind, Vec<DeleteFailure>>,
    /// Kinds whose final bulk update failed after the provider deletions succeeded.
    pub bookkeeping_errors: Vec<(ResourceKind, TrackerError)>,
}

impl RetirementOutcome {
    pub fn confirmed_ids(&self, kind: ResourceKind) -> Vec<String> {
        self.confirmed
            .get(&kind)
            .map(|ids| ids.iter().map(|k| k.resource_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn failed_ids(&self, kind: ResourceKind) -> Vec<String> {
        self.failed
            .get(&kind)
            .map(|f| f.iter().map(|d| d.resource.resource_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.values().map(Vec::len).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.values().map(Vec::len).sum()
    }

    /// Nothing failed and every confirmed deletion was recorded.
    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0 && self.bookkeeping_errors.is_empty()
    }

    fn merge(&mut self, site: SiteOutcome) {
        for (kind, ids) in site.confirmed {
            self.confirmed.entry(kind).or_default().extend(ids);
        }
        for (kind, failures) in site.failed {
            self.failed.entry(kind).or_default().extend(failures);
        }
    }
}

#[derive(Default)]
struct SiteOutcome {
    confirmed: BTreeMap<ResourceKind, Vec<SiteResourceId>>,
    failed: BTreeMap<ResourceKind, Vec<DeleteFailure>>,
}

impl SiteOutcome {
    fn confirm(&mut self, resource: &TrackedResource) {
        self.confirmed.entry(resource.kind()).or_default().push(resource.key());
    }

    fn fail(&mut self, resource: &TrackedResource, reason: String) {
        self.failed.entry(resource.kind()).or_default().push(DeleteFailure {
            resource: resource.key(),
            reason,
        });
    }
}

/// Per-site deletion stages. Ports on target networks are cleared between
/// routers and subnets.
const DELETION_ORDER: [ResourceKind; 6] = [
    ResourceKind::Server,
    ResourceKind::Router,
    ResourceKind::Subnet,
    ResourceKind::Network,
    ResourceKind::FloatingIp,
    ResourceKind::GpuLease,
];

/// Delete the selected resources, or only describe them when `dry_run` is set.
///
/// A dry run calls neither the gateways nor the ledger. Otherwise each site is
/// processed in dependency order; a failure only excludes that resource, and
/// the ledger receives one call per kind with the confirmed ids.
pub async fn retire(
    selection: &Selection,
    dry_run: bool,
    gateways: &SiteGateways,
    ledger: &dyn DeletionLedger,
) -> RetirementOutcome {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("retire", %run_id, dry_run);

    async move {
        if dry_run {
            let text = preview::render(selection, Utc::now());
            tracing::info!(selected = selection.total(), "dry run, nothing deleted");
            return RetirementOutcome {
                dry_run: true,
                preview: Some(text),
                ..Default::default()
            };
        }

        let mut by_site: BTreeMap<Site, Vec<&TrackedResource>> = BTreeMap::new();
        for resources in selection.by_kind.values() {
            for r in resources {
                by_site.entry(r.site).or_default().push(r);
            }
        }

        let passes = by_site.into_iter().map(|(site, resources)| async move {
            match gateways.get(site) {
                Some(gateway) => retire_site(gateway.as_ref(), &resources).await,
                None => {
                    tracing::error!(%site, count = resources.len(), "no gateway for site, skipping its resources");
                    let mut outcome = SiteOutcome::default();
                    for r in resources {
                        outcome.fail(r, format!("no gateway available for site {}", site));
                    }
                    outcome
                }
            }
        });

        let mut outcome = RetirementOutcome::default();
        for site in futures_util::future::join_all(passes).await {
            outcome.merge(site);
        }

        for (kind, ids) in &outcome.confirmed {
            if ids.is_empty() {
                continue;
            }
            match ledger.confirm_deleted(*kind, ids).await {
                Ok(rows) => tracing::info!(%kind, confirmed = ids.len(), rows, "deletions recorded"),
                Err(e) => {
                    tracing::error!(%kind, confirmed = ids.len(), error = %e, "failed to record deletions");
                    outcome.bookkeeping_errors.push((*kind, e));
                }
            }
        }

        tracing::info!(
            confirmed = outcome.confirmed_count(),
            failed = outcome.failed_count(),
            "retirement finished"
        );
        outcome
    }
    .instrument(span)
    .await
}

async fn retire_site(gateway: &dyn CloudGateway, resources: &[&TrackedResource]) -> SiteOutcome {
    let site = gateway.site();
    let mut outcome = SiteOutcome::default();

    let mut ports_cleared = false;
    for kind in DELETION_ORDER {
        // Networks refuse deletion while ports remain.
        if !ports_cleared && matches!(kind, ResourceKind::Subnet | ResourceKind::Network) {
            clear_target_network_ports(gateway, resources).await;
            ports_cleared = true;
        }

        let batch: Vec<&TrackedResource> = resources.iter().copied().filter(|r| r.kind() == kind).collect();
        if batch.is_empty() {
            continue;
        }

        for resource in batch {
            let id = resource.resource_id.as_str();
            tracing::info!(%site, %kind, resource_id = id, "delete-attempt");
            match delete_one(gateway, resource).await {
                Ok(()) => {
                    tracing::info!(%site, %kind, resource_id = id, "delete-confirmed");
                    outcome.confirm(resource);
                }
                Err(e) => {
                    let err = TrackerError::gateway(site, format!("delete {}", kind), e);
                    tracing::error!(%site, %kind, resource_id = id, error = %err, "delete-failed");
                    outcome.fail(resource, err.to_string());
                }
            }
        }
    }
    outcome
}

async fn delete_one(gateway: &dyn CloudGateway, resource: &TrackedResource) -> anyhow::Result<()> {
    match &resource.payload {
        ResourcePayload::Server(details) => {
            for address in details.floating_addresses() {
                release_address(gateway, resource, address).await;
            }
        }
        ResourcePayload::Router(details) => {
            clean_router(gateway, &resource.resource_id, details.external_gateway.is_some()).await
        }
        _ => {}
    }
    gateway.delete(resource.kind(), &resource.resource_id).await
}

async fn release_address(gateway: &dyn CloudGateway, server: &TrackedResource, address: &str) {
    let site = gateway.site();
    match gateway.release_floating_ip(address).await {
        Ok(true) => tracing::info!(%site, kind = "server", resource_id = %server.resource_id, address, "cleanup: floating ip released"),
        Ok(false) => tracing::debug!(%site, kind = "server", resource_id = %server.resource_id, address, "cleanup: floating ip already gone"),
        Err(e) => tracing::warn!(%site, kind = "server", resource_id = %server.resource_id, address, error = %e, "cleanup: floating ip release failed"),
    }
}

/// Clear the external gateway if the router has one, then detach every
/// interface. Failures are logged and the router delete is still attempted.
async fn clean_router(gateway: &dyn CloudGateway, router_id: &str, has_external_gateway: bool) {
    let site = gateway.site();
    if has_external_gateway {
        match gateway.clear_gateway(router_id).await {
            Ok(()) => tracing::info!(%site, kind = "router", resource_id = router_id, "cleanup: external gateway cleared"),
            Err(e) => tracing::warn!(%site, kind = "router", resource_id = router_id, error = %e, "cleanup: gateway clear failed"),
        }
    } else {
        tracing::debug!(%site, kind = "router", resource_id = router_id, "cleanup: no external gateway to clear");
    }

    let ports = match gateway.list_ports(&PortFilter::Device(router_id.to_string())).await {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!(%site, kind = "router", resource_id = router_id, error = %e, "cleanup: listing router ports failed");
            return;
        }
    };
    for port in ports.iter().filter(|p| p.is_router_interface()) {
        for subnet_id in &port.subnet_ids {
            detach(gateway, router_id, subnet_id).await;
        }
    }
}

async fn detach(gateway: &dyn CloudGateway, router_id: &str, subnet_id: &str) {
    let site = gateway.site();
    match gateway.detach_interface(router_id, subnet_id).await {
        Ok(()) => tracing::info!(%site, kind = "router", resource_id = router_id, subnet_id, "cleanup: interface detached"),
        Err(e) => tracing::warn!(%site, kind = "router", resource_id = router_id, subnet_id, error = %e, "cleanup: interface detach failed"),
    }
}

/// Remove the ports still attached to every network selected at this site.
/// Router interfaces go through their router; dhcp ports go with the network.
async fn clear_target_network_ports(gateway: &dyn CloudGateway, resources: &[&TrackedResource]) {
    let site = gateway.site();
    for network in resources.iter().filter(|r| r.kind() == ResourceKind::Network) {
        let network_id = network.resource_id.as_str();
        let ports = match gateway.list_ports(&PortFilter::Network(network_id.to_string())).await {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!(%site, kind = "network", resource_id = network_id, error = %e, "cleanup: listing network ports failed");
                continue;
            }
        };

        for port in ports {
            if port.is_dhcp() {
                continue;
            }
            if port.is_router_interface() {
                match port.device_id.as_deref() {
                    Some(router_id) => {
                        for subnet_id in &port.subnet_ids {
                            detach(gateway, router_id, subnet_id).await;
                        }
                    }
                    None => tracing::warn!(%site, kind = "network", resource_id = network_id, port_id = %port.port_id, "cleanup: router interface without router"),
                }
                continue;
            }
            match gateway.delete_port(&port.port_id).await {
                Ok(()) => tracing::info!(%site, kind = "network", resource_id = network_id, port_id = %port.port_id, "cleanup: port removed"),
                Err(e) => tracing::warn!(%site, kind = "network", resource_id = network_id, port_id = %port.port_id, error = %e, "cleanup: port removal failed"),
            }
        }
    }
}
