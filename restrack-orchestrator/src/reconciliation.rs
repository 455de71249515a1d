use chrono::{DateTime, Utc};
use restrack_common::payload::LeaseReservation;
use restrack_common::{ResourceKind, ResourcePayload, Site, TrackerError, TrackerResult};
use restrack_providers::inventory::{DiscoveredResource, Listing};
use restrack_providers::CloudGateway;
use sqlx::{Connection, PgConnection, Pool, Postgres, Transaction};
use std::collections::{BTreeMap, HashSet};
use tracing::Instrument;
use uuid::Uuid;

use crate::inventory_store as store;
use crate::provider_manager::SiteGateways;

/// Anything that carries a stable external id in a live listing.
pub trait Observed {
    fn observed_id(&self) -> &str;
}

impl Observed for DiscoveredResource {
    fn observed_id(&self) -> &str {
        &self.resource_id
    }
}

impl Observed for LeaseReservation {
    fn observed_id(&self) -> &str {
        &self.reservation_id
    }
}

/// Diff of one live listing against the ids already recorded.
#[derive(Debug)]
pub struct PassPlan<'a, T> {
    pub updates: Vec<&'a T>,
    pub inserts: Vec<&'a T>,
    /// Known ids missing from the listing, sorted.
    pub vanished: Vec<String>,
}

/// Split a live listing into updates, inserts and vanished ids.
///
/// Duplicate ids in `live` are planned once (first occurrence wins). Ids in
/// `unverifiable` were reported by the provider but could not be read; they are
/// neither updated nor considered vanished.
pub fn plan_pass<'a, T: Observed>(
    known: &HashSet<String>,
    live: &'a [T],
    unverifiable: &HashSet<String>,
) -> PassPlan<'a, T> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut updates = Vec::new();
    let mut inserts = Vec::new();

    for item in live {
        let id = item.observed_id();
        if !seen.insert(id) || unverifiable.contains(id) {
            continue;
        }
        if known.contains(id) {
            updates.push(item);
        } else {
            inserts.push(item);
        }
    }

    let mut vanished: Vec<String> = known
        .iter()
        .filter(|id| !seen.contains(id.as_str()) && !unverifiable.contains(id.as_str()))
        .cloned()
        .collect();
    vanished.sort();

    PassPlan {
        updates,
        inserts,
        vanished,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindTally {
    pub inserted: usize,
    pub updated: usize,
    pub marked_absent: usize,
    pub malformed: usize,
    /// Rows the database rejected; each was rolled back on its own.
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct SiteReport {
    pub site: Site,
    pub run_id: Uuid,
    pub seen_at: DateTime<Utc>,
    pub kinds: BTreeMap<ResourceKind, KindTally>,
    pub reservations: KindTally,
    /// Kinds the site does not expose; nothing was written for them.
    pub skipped: Vec<ResourceKind>,
}

/// Every live listing of one site, fetched before any write.
#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    pub site: Site,
    pub listings: Vec<(ResourceKind, Listing)>,
    pub skipped: Vec<ResourceKind>,
}

pub async fn fetch_snapshot(
    gateway: &dyn CloudGateway,
    kinds: &[ResourceKind],
) -> TrackerResult<SiteSnapshot> {
    let site = gateway.site();
    let mut snapshot = SiteSnapshot {
        site,
        listings: Vec::with_capacity(kinds.len()),
        skipped: Vec::new(),
    };
    for &kind in kinds {
        if !gateway.supports(kind) {
            tracing::info!(%site, %kind, "kind not available at site, skipping");
            snapshot.skipped.push(kind);
            continue;
        }
        let listing = gateway
            .list(kind)
            .await
            .map_err(|e| TrackerError::gateway(site, format!("list {}", kind.plural()), e))?;
        tracing::debug!(%site, %kind, count = listing.items.len(), "listing fetched");
        snapshot.listings.push((kind, listing));
    }
    Ok(snapshot)
}

/// Write one snapshot into the inventory. The caller owns the transaction.
pub async fn apply_snapshot(
    conn: &mut PgConnection,
    snapshot: &SiteSnapshot,
    seen_at: DateTime<Utc>,
    run_id: Uuid,
) -> TrackerResult<SiteReport> {
    let mut report = SiteReport {
        site: snapshot.site,
        run_id,
        seen_at,
        kinds: BTreeMap::new(),
        reservations: KindTally::default(),
        skipped: snapshot.skipped.clone(),
    };
    for (kind, listing) in &snapshot.listings {
        let tally = reconcile_kind(
            conn,
            snapshot.site,
            *kind,
            listing,
            seen_at,
            &mut report.reservations,
        )
        .await?;
        report.kinds.insert(*kind, tally);
    }
    Ok(report)
}

async fn reconcile_kind(
    conn: &mut PgConnection,
    site: Site,
    kind: ResourceKind,
    listing: &Listing,
    seen_at: DateTime<Utc>,
    reservations: &mut KindTally,
) -> TrackerResult<KindTally> {
    let mut tally = KindTally {
        malformed: listing.malformed.len(),
        ..KindTally::default()
    };

    for bad in &listing.malformed {
        let err = TrackerError::Validation {
            kind,
            resource_id: bad.resource_id.clone(),
            reason: bad.reason.clone(),
        };
        tracing::warn!(%site, %kind, error = %err, "skipping malformed resource");
    }
    let unverifiable: HashSet<String> = listing
        .malformed
        .iter()
        .filter_map(|m| m.resource_id.clone())
        .collect();
    // An unreadable object without an id could be any known resource.
    let withhold_absence = listing.malformed.iter().any(|m| m.resource_id.is_none());

    let known = store::known_ids(conn, kind, site).await?;
    let plan = plan_pass(&known, &listing.items, &unverifiable);

    let mut rejected: HashSet<&str> = HashSet::new();
    for resource in &plan.updates {
        let mut savepoint = conn.begin().await?;
        let written = store::update_resource(&mut savepoint, site, resource, seen_at).await;
        match settle(savepoint, written).await? {
            None => {
                tracing::info!(%site, %kind, resource_id = %resource.resource_id, "update");
                tally.updated += 1;
            }
            Some(e) => {
                tracing::warn!(%site, %kind, resource_id = %resource.resource_id, error = %e, "update rejected, row left as it was");
                rejected.insert(&resource.resource_id);
                tally.failed += 1;
            }
        }
    }
    for resource in &plan.inserts {
        let mut savepoint = conn.begin().await?;
        let written = store::insert_resource(&mut savepoint, site, resource, seen_at).await;
        match settle(savepoint, written).await? {
            None => {
                tracing::info!(%site, %kind, resource_id = %resource.resource_id, "insert");
                tally.inserted += 1;
            }
            Some(e) => {
                tracing::warn!(%site, %kind, resource_id = %resource.resource_id, error = %e, "insert rejected, not recorded");
                rejected.insert(&resource.resource_id);
                tally.failed += 1;
            }
        }
    }

    if withhold_absence {
        tracing::warn!(
            %site,
            %kind,
            candidates = plan.vanished.len(),
            "listing contained unidentifiable objects; absence marking withheld this pass"
        );
    } else {
        let marked = store::mark_absent(conn, kind, site, &plan.vanished, seen_at).await?;
        for id in &marked {
            tracing::info!(%site, %kind, resource_id = %id, "mark-absent");
        }
        tally.marked_absent = marked.len();
    }

    if kind == ResourceKind::GpuLease {
        let written = plan.updates.iter().chain(plan.inserts.iter());
        for lease in written.filter(|l| !rejected.contains(l.resource_id.as_str())) {
            reconcile_reservations(conn, site, lease, seen_at, reservations).await?;
        }
    }

    Ok(tally)
}

/// Same diff, scoped to the reservations of one lease.
async fn reconcile_reservations(
    conn: &mut PgConnection,
    site: Site,
    lease: &DiscoveredResource,
    seen_at: DateTime<Utc>,
    tally: &mut KindTally,
) -> TrackerResult<()> {
    let ResourcePayload::GpuLease(details) = &lease.payload else {
        return Ok(());
    };
    let lease_id = lease.resource_id.as_str();
    let known = store::known_reservation_ids(conn, site, lease_id).await?;
    let plan = plan_pass(&known, &details.reservations, &HashSet::new());

    let planned = plan
        .updates
        .iter()
        .map(|r| (*r, true))
        .chain(plan.inserts.iter().map(|r| (*r, false)));
    for (r, known) in planned {
        let mut savepoint = conn.begin().await?;
        let written = store::upsert_reservation(&mut savepoint, site, lease_id, r, seen_at, known).await;
        let action = if known { "update reservation" } else { "insert reservation" };
        match settle(savepoint, written).await? {
            None => {
                tracing::info!(%site, lease_id, reservation_id = %r.reservation_id, "{}", action);
                if known {
                    tally.updated += 1;
                } else {
                    tally.inserted += 1;
                }
            }
            Some(e) => {
                tracing::warn!(%site, lease_id, reservation_id = %r.reservation_id, error = %e, "{} rejected", action);
                tally.failed += 1;
            }
        }
    }
    let marked =
        store::mark_reservations_absent(conn, site, lease_id, &plan.vanished, seen_at).await?;
    for id in &marked {
        tracing::info!(%site, lease_id, reservation_id = %id, "mark-absent reservation");
    }
    tally.marked_absent += marked.len();
    Ok(())
}

/// Release a per-row savepoint: keep the write, or undo it and hand back the
/// error. Only a failure to release the savepoint itself is fatal to the site.
async fn settle(
    savepoint: Transaction<'_, Postgres>,
    written: TrackerResult<()>,
) -> TrackerResult<Option<TrackerError>> {
    match written {
        Ok(()) => {
            savepoint.commit().await?;
            Ok(None)
        }
        Err(e) => {
            savepoint.rollback().await?;
            Ok(Some(e))
        }
    }
}

/// One reconciliation pass for one site: fetch everything, then write it in a
/// single transaction. A row the database rejects is skipped and counted; any
/// other error rolls the whole site back.
pub async fn reconcile_site(
    pool: &Pool<Postgres>,
    gateway: &dyn CloudGateway,
) -> TrackerResult<SiteReport> {
    let site = gateway.site();
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("reconcile", %site, %run_id);

    async move {
        let snapshot = fetch_snapshot(gateway, &ResourceKind::ALL).await?;
        let seen_at = Utc::now();

        let mut tx = pool.begin().await?;
        let report = apply_snapshot(&mut tx, &snapshot, seen_at, run_id).await?;
        tx.commit().await?;

        for (kind, t) in &report.kinds {
            tracing::info!(
                %kind,
                inserted = t.inserted,
                updated = t.updated,
                marked_absent = t.marked_absent,
                malformed = t.malformed,
                failed = t.failed,
                "kind reconciled"
            );
        }
        Ok::<_, TrackerError>(report)
    }
    .instrument(span)
    .await
}

/// Reconcile every configured site concurrently. Each site is its own
/// transaction; one site failing does not affect the others.
pub async fn reconcile_all(
    pool: &Pool<Postgres>,
    gateways: &SiteGateways,
) -> Vec<(Site, TrackerResult<SiteReport>)> {
    let passes = gateways.iter().map(|(site, gateway)| async move {
        let result = reconcile_site(pool, gateway.as_ref()).await;
        match &result {
            Ok(_) => tracing::info!(%site, "✅ site reconciled"),
            Err(e) => tracing::error!(%site, error = %e, "❌ site reconciliation failed, rolled back"),
        }
        (*site, result)
    });
    futures_util::future::join_all(passes).await
}

/// job-tracker: reconcile every site on a fixed period, forever.
pub async fn run(pool: Pool<Postgres>, gateways: SiteGateways, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    tracing::info!(
        sites = ?gateways.sites(),
        period_secs = period.as_secs(),
        "🔍 job-tracker started"
    );

    loop {
        interval.tick().await;

        let results = reconcile_all(&pool, &gateways).await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(failed, total = results.len(), "job-tracker: pass finished with failures");
        }
    }
}
