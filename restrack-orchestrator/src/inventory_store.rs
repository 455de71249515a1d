//! Inventory store access.
//!
//! Every statement is static text selected through [`descriptor`]; table names
//! come from [`ResourceKind`] and are never built from input. All functions
//! take a `&mut PgConnection` so callers decide the transaction boundary.

use chrono::{DateTime, Utc};
use restrack_common::payload::LeaseReservation;
use restrack_common::records::{
    FloatingIpRow, GpuLeaseRow, NetworkRow, RouterRow, ServerRow, SubnetRow,
};
use restrack_common::{
    ResourceKind, ResourcePayload, Site, SiteResourceId, TrackedResource, TrackerError,
    TrackerResult,
};
use restrack_providers::inventory::DiscoveredResource;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres};
use std::collections::HashSet;

/// Static SQL for one resource kind.
///
/// Insert and update bind the same parameters: `$1` resource_id, `$2`
/// project_site, `$3` name, `$4` status, `$5` created, `$6` updated, `$7`
/// last seen, then the kind's own columns from `$8` on.
#[derive(Debug)]
pub struct KindDescriptor {
    pub kind: ResourceKind,
    pub table: &'static str,
    pub known_ids: &'static str,
    pub insert: &'static str,
    pub update: &'static str,
    pub mark_absent: &'static str,
    pub select_stale: &'static str,
    pub confirm_deleted: &'static str,
}

macro_rules! kind_descriptor {
    ($kind:expr, $table:literal, cols: $cols:literal, params: $params:literal, set: $set:literal) => {
        KindDescriptor {
            kind: $kind,
            table: $table,
            known_ids: concat!("SELECT resource_id FROM ", $table, " WHERE project_site = $1"),
            insert: concat!(
                "INSERT INTO ", $table,
                " (resource_id, project_site, resource_name, status, created_time, updated_time, last_seen_time, ",
                $cols, ") VALUES ($1, $2, $3, $4, $5, $6, $7, ", $params, ")"
            ),
            update: concat!(
                "UPDATE ", $table,
                " SET resource_name = $3, status = $4, created_time = COALESCE($5, created_time), \
                 updated_time = $6, last_seen_time = $7, ",
                $set, " WHERE resource_id = $1 AND project_site = $2"
            ),
            mark_absent: concat!(
                "UPDATE ", $table,
                " SET first_time_not_seen = $1, user_deleted = NOT system_deleted \
                 WHERE project_site = $2 AND resource_id = ANY($3) AND first_time_not_seen IS NULL \
                 RETURNING resource_id"
            ),
            select_stale: concat!(
                "SELECT * FROM ", $table,
                " WHERE created_time < $1 AND first_time_not_seen IS NULL AND system_deleted = FALSE \
                 AND ($2::text IS NULL OR project_site = $2) AND resource_name <> ALL($3) \
                 ORDER BY created_time ASC, resource_id ASC"
            ),
            confirm_deleted: concat!(
                "UPDATE ", $table,
                " SET system_deleted = TRUE, updated_time = NOW() \
                 WHERE (resource_id, project_site) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))"
            ),
        }
    };
}

static SERVERS: KindDescriptor = kind_descriptor!(
    ResourceKind::Server, "servers",
    cols: "flavor, image, security_groups, addresses",
    params: "$8, $9, $10, $11",
    set: "flavor = $8, image = $9, security_groups = $10, addresses = $11"
);

static NETWORKS: KindDescriptor = kind_descriptor!(
    ResourceKind::Network, "networks",
    cols: "port_security_enabled",
    params: "$8",
    set: "port_security_enabled = $8"
);

static ROUTERS: KindDescriptor = kind_descriptor!(
    ResourceKind::Router, "routers",
    cols: "external_gateway_info",
    params: "$8",
    set: "external_gateway_info = $8"
);

static SUBNETS: KindDescriptor = kind_descriptor!(
    ResourceKind::Subnet, "subnets",
    cols: "network_id, cidr, allocation_pools",
    params: "$8, $9, $10",
    set: "network_id = $8, cidr = $9, allocation_pools = $10"
);

static FLOATING_IPS: KindDescriptor = kind_descriptor!(
    ResourceKind::FloatingIp, "floating_ips",
    cols: "floating_ip_address, fixed_ip_address, port_id, router_id, floating_network_id",
    params: "$8, $9, $10, $11, $12",
    set: "floating_ip_address = $8, fixed_ip_address = $9, port_id = $10, router_id = $11, floating_network_id = $12"
);

static GPU_LEASES: KindDescriptor = kind_descriptor!(
    ResourceKind::GpuLease, "gpu_leases",
    cols: "user_id, project_id, start_date, end_date, degraded, trust_id",
    params: "$8, $9, $10, $11, $12, $13",
    set: "user_id = $8, project_id = $9, start_date = $10, end_date = $11, degraded = $12, trust_id = $13"
);

pub fn descriptor(kind: ResourceKind) -> &'static KindDescriptor {
    match kind {
        ResourceKind::Server => &SERVERS,
        ResourceKind::Network => &NETWORKS,
        ResourceKind::Router => &ROUTERS,
        ResourceKind::Subnet => &SUBNETS,
        ResourceKind::FloatingIp => &FLOATING_IPS,
        ResourceKind::GpuLease => &GPU_LEASES,
    }
}

// --- Reconciliation writes ---

pub async fn known_ids(
    conn: &mut PgConnection,
    kind: ResourceKind,
    site: Site,
) -> TrackerResult<HashSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar(descriptor(kind).known_ids)
        .bind(site.as_str())
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids.into_iter().collect())
}

fn bind_resource<'q>(
    query: Query<'q, Postgres, PgArguments>,
    site: Site,
    r: &'q DiscoveredResource,
    seen_at: DateTime<Utc>,
) -> Query<'q, Postgres, PgArguments> {
    let query = query
        .bind(r.resource_id.as_str())
        .bind(site.as_str())
        .bind(r.resource_name.as_str())
        .bind(r.status.as_str())
        .bind(r.created_time)
        .bind(r.updated_time)
        .bind(seen_at);
    match &r.payload {
        ResourcePayload::Server(s) => query
            .bind(s.flavor.as_deref())
            .bind(s.image.as_deref())
            .bind(&s.security_groups)
            .bind(Json(&s.addresses)),
        ResourcePayload::Network(n) => query.bind(n.port_security_enabled),
        ResourcePayload::Router(rt) => query.bind(rt.external_gateway.as_ref().map(Json)),
        ResourcePayload::Subnet(s) => query
            .bind(s.network_id.as_deref())
            .bind(s.cidr.as_deref())
            .bind(Json(&s.allocation_pools)),
        ResourcePayload::FloatingIp(f) => query
            .bind(f.floating_ip_address.as_deref())
            .bind(f.fixed_ip_address.as_deref())
            .bind(f.port_id.as_deref())
            .bind(f.router_id.as_deref())
            .bind(f.floating_network_id.as_deref()),
        ResourcePayload::GpuLease(l) => query
            .bind(l.user_id.as_deref())
            .bind(l.project_id.as_deref())
            .bind(l.start_date)
            .bind(l.end_date)
            .bind(l.degraded)
            .bind(l.trust_id.as_deref()),
    }
}

pub async fn insert_resource(
    conn: &mut PgConnection,
    site: Site,
    resource: &DiscoveredResource,
    seen_at: DateTime<Utc>,
) -> TrackerResult<()> {
    let sql = descriptor(resource.kind()).insert;
    bind_resource(sqlx::query(sql), site, resource, seen_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Refresh mutable fields and `last_seen_time`. Absence markers are left as they are.
pub async fn update_resource(
    conn: &mut PgConnection,
    site: Site,
    resource: &DiscoveredResource,
    seen_at: DateTime<Utc>,
) -> TrackerResult<()> {
    let sql = descriptor(resource.kind()).update;
    bind_resource(sqlx::query(sql), site, resource, seen_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Returns the ids that transitioned to absent. Rows already marked are untouched.
pub async fn mark_absent(
    conn: &mut PgConnection,
    kind: ResourceKind,
    site: Site,
    ids: &[String],
    seen_at: DateTime<Utc>,
) -> TrackerResult<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let marked: Vec<String> = sqlx::query_scalar(descriptor(kind).mark_absent)
        .bind(seen_at)
        .bind(site.as_str())
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    Ok(marked)
}

// --- Lease reservations ---

const RESERVATION_KNOWN_IDS: &str =
    "SELECT reservation_id FROM gpu_lease_reservations WHERE lease_id = $1 AND project_site = $2";

const RESERVATION_INSERT: &str = "INSERT INTO gpu_lease_reservations \
     (reservation_id, project_site, lease_id, resource_id, resource_type, status, created_time, \
      updated_time, last_seen_time, missing_resources, resources_changed, resource_properties, \
      network_id, min_hosts, max_hosts) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)";

const RESERVATION_UPDATE: &str = "UPDATE gpu_lease_reservations \
     SET lease_id = $3, resource_id = $4, resource_type = $5, status = $6, \
         created_time = COALESCE($7, created_time), updated_time = $8, last_seen_time = $9, \
         missing_resources = $10, resources_changed = $11, resource_properties = $12, \
         network_id = $13, min_hosts = $14, max_hosts = $15 \
     WHERE reservation_id = $1 AND project_site = $2";

const RESERVATION_MARK_ABSENT: &str = "UPDATE gpu_lease_reservations \
     SET first_time_not_seen = $1, user_deleted = NOT system_deleted \
     WHERE lease_id = $2 AND project_site = $3 AND reservation_id = ANY($4) \
       AND first_time_not_seen IS NULL \
     RETURNING reservation_id";

pub async fn known_reservation_ids(
    conn: &mut PgConnection,
    site: Site,
    lease_id: &str,
) -> TrackerResult<HashSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar(RESERVATION_KNOWN_IDS)
        .bind(lease_id)
        .bind(site.as_str())
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids.into_iter().collect())
}

pub async fn upsert_reservation(
    conn: &mut PgConnection,
    site: Site,
    lease_id: &str,
    r: &LeaseReservation,
    seen_at: DateTime<Utc>,
    known: bool,
) -> TrackerResult<()> {
    let sql = if known {
        RESERVATION_UPDATE
    } else {
        RESERVATION_INSERT
    };
    sqlx::query(sql)
        .bind(r.reservation_id.as_str())
        .bind(site.as_str())
        .bind(lease_id)
        .bind(r.resource_id.as_deref())
        .bind(r.resource_type.as_deref())
        .bind(r.status.as_str())
        .bind(r.created_time)
        .bind(r.updated_time)
        .bind(seen_at)
        .bind(r.missing_resources)
        .bind(r.resources_changed)
        .bind(Json(&r.resource_properties))
        .bind(r.network_id.as_deref())
        .bind(r.min_hosts)
        .bind(r.max_hosts)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_reservations_absent(
    conn: &mut PgConnection,
    site: Site,
    lease_id: &str,
    ids: &[String],
    seen_at: DateTime<Utc>,
) -> TrackerResult<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let marked: Vec<String> = sqlx::query_scalar(RESERVATION_MARK_ABSENT)
        .bind(seen_at)
        .bind(lease_id)
        .bind(site.as_str())
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    Ok(marked)
}

// --- Retirement reads and bookkeeping ---

async fn load_stale<R>(
    conn: &mut PgConnection,
    kind: ResourceKind,
    cutoff: DateTime<Utc>,
    site: Option<Site>,
    protected: &[String],
) -> TrackerResult<Vec<TrackedResource>>
where
    R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    TrackedResource: TryFrom<R, Error = TrackerError>,
{
    let rows: Vec<R> = sqlx::query_as::<_, R>(descriptor(kind).select_stale)
        .bind(cutoff)
        .bind(site.map(|s| s.as_str()))
        .bind(protected)
        .fetch_all(&mut *conn)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match TrackedResource::try_from(row) {
            Ok(r) => out.push(r),
            Err(e) => tracing::warn!(kind = %kind, error = %e, "skipping unreadable inventory row"),
        }
    }
    Ok(out)
}

/// Present, not yet retired rows created before `cutoff`, oldest first.
/// Rows named in `protected` are left out.
pub async fn select_stale(
    conn: &mut PgConnection,
    kind: ResourceKind,
    cutoff: DateTime<Utc>,
    site: Option<Site>,
    protected: &[String],
) -> TrackerResult<Vec<TrackedResource>> {
    match kind {
        ResourceKind::Server => load_stale::<ServerRow>(conn, kind, cutoff, site, protected).await,
        ResourceKind::Network => load_stale::<NetworkRow>(conn, kind, cutoff, site, protected).await,
        ResourceKind::Router => load_stale::<RouterRow>(conn, kind, cutoff, site, protected).await,
        ResourceKind::Subnet => load_stale::<SubnetRow>(conn, kind, cutoff, site, protected).await,
        ResourceKind::FloatingIp => {
            load_stale::<FloatingIpRow>(conn, kind, cutoff, site, protected).await
        }
        ResourceKind::GpuLease => {
            load_stale::<GpuLeaseRow>(conn, kind, cutoff, site, protected).await
        }
    }
}

/// One statement flags every confirmed `(resource_id, project_site)` pair.
pub async fn confirm_deleted(
    conn: &mut PgConnection,
    kind: ResourceKind,
    ids: &[SiteResourceId],
) -> TrackerResult<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let (resource_ids, sites): (Vec<String>, Vec<String>) = ids
        .iter()
        .map(|k| (k.resource_id.clone(), k.site.as_str().to_string()))
        .unzip();
    let res = sqlx::query(descriptor(kind).confirm_deleted)
        .bind(resource_ids)
        .bind(sites)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_its_own_table() {
        let tables: HashSet<&str> = ResourceKind::ALL.iter().map(|k| descriptor(*k).table).collect();
        assert_eq!(tables.len(), ResourceKind::ALL.len());
        for kind in ResourceKind::ALL {
            let d = descriptor(kind);
            assert_eq!(d.kind, kind);
            assert_eq!(d.table, kind.plural());
        }
    }

    #[test]
    fn insert_and_update_agree_on_parameter_count() {
        fn max_param(sql: &str) -> usize {
            sql.split('$')
                .skip(1)
                .filter_map(|s| {
                    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
                    digits.parse().ok()
                })
                .max()
                .unwrap_or(0)
        }
        for kind in ResourceKind::ALL {
            let d = descriptor(kind);
            assert_eq!(max_param(d.insert), max_param(d.update), "{}", kind);
            assert!(max_param(d.insert) >= 8, "{}", kind);
        }
        assert_eq!(max_param(RESERVATION_INSERT), max_param(RESERVATION_UPDATE));
    }

    #[test]
    fn absence_marking_never_overwrites_and_updates_never_revive() {
        for kind in ResourceKind::ALL {
            let d = descriptor(kind);
            assert!(d.mark_absent.contains("first_time_not_seen IS NULL"));
            assert!(!d.update.contains("first_time_not_seen"));
            assert!(d.select_stale.contains("first_time_not_seen IS NULL"));
            assert!(d.select_stale.contains("ORDER BY created_time ASC"));
        }
        assert!(!RESERVATION_UPDATE.contains("first_time_not_seen"));
    }
}
