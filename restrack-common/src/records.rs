//! Inventory rows (SQLx mapped) and the typed records built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;

use crate::error::{TrackerError, TrackerResult};
use crate::payload::*;
use crate::{ResourceKind, Site};

/// Identity of one inventory record: `(resource_id, project_site)` is unique per kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteResourceId {
    pub site: Site,
    pub resource_id: String,
}

impl SiteResourceId {
    pub fn new(site: Site, resource_id: impl Into<String>) -> Self {
        Self {
            site,
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for SiteResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.resource_id)
    }
}

/// A resource as recorded in the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedResource {
    pub resource_id: String,
    pub resource_name: String,
    pub status: String,
    pub site: Site,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub last_seen_time: DateTime<Utc>,
    pub first_time_not_seen: Option<DateTime<Utc>>,
    pub payload: ResourcePayload,
}

impl TrackedResource {
    pub fn kind(&self) -> ResourceKind {
        self.payload.kind()
    }

    pub fn key(&self) -> SiteResourceId {
        SiteResourceId::new(self.site, self.resource_id.clone())
    }
}

// --- Rows ---

/// Columns shared by every resource table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LifecycleColumns {
    pub resource_id: String,
    pub resource_name: String,
    pub status: String,
    pub project_site: String,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub last_seen_time: DateTime<Utc>,
    pub first_time_not_seen: Option<DateTime<Utc>>,
}

impl LifecycleColumns {
    fn into_tracked(self, payload: ResourcePayload) -> TrackerResult<TrackedResource> {
        let site = self
            .project_site
            .parse::<Site>()
            .map_err(|reason| TrackerError::Validation {
                kind: payload.kind(),
                resource_id: Some(self.resource_id.clone()),
                reason,
            })?;
        Ok(TrackedResource {
            resource_id: self.resource_id,
            resource_name: self.resource_name,
            status: self.status,
            site,
            created_time: self.created_time,
            updated_time: self.updated_time,
            last_seen_time: self.last_seen_time,
            first_time_not_seen: self.first_time_not_seen,
            payload,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    #[sqlx(flatten)]
    pub base: LifecycleColumns,
    pub flavor: Option<String>,
    pub image: Option<String>,
    pub security_groups: Vec<String>,
    pub addresses: Json<AddressMap>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NetworkRow {
    #[sqlx(flatten)]
    pub base: LifecycleColumns,
    pub port_security_enabled: Option<bool>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RouterRow {
    #[sqlx(flatten)]
    pub base: LifecycleColumns,
    pub external_gateway_info: Option<Json<ExternalGateway>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubnetRow {
    #[sqlx(flatten)]
    pub base: LifecycleColumns,
    pub network_id: Option<String>,
    pub cidr: Option<String>,
    pub allocation_pools: Json<Vec<AllocationPool>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FloatingIpRow {
    #[sqlx(flatten)]
    pub base: LifecycleColumns,
    pub floating_ip_address: Option<String>,
    pub fixed_ip_address: Option<String>,
    pub port_id: Option<String>,
    pub router_id: Option<String>,
    pub floating_network_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GpuLeaseRow {
    #[sqlx(flatten)]
    pub base: LifecycleColumns,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub trust_id: Option<String>,
}

impl TryFrom<ServerRow> for TrackedResource {
    type Error = TrackerError;

    fn try_from(row: ServerRow) -> TrackerResult<Self> {
        row.base.into_tracked(ResourcePayload::Server(ServerDetails {
            flavor: row.flavor,
            image: row.image,
            security_groups: row.security_groups,
            addresses: row.addresses.0,
        }))
    }
}

impl TryFrom<NetworkRow> for TrackedResource {
    type Error = TrackerError;

    fn try_from(row: NetworkRow) -> TrackerResult<Self> {
        row.base.into_tracked(ResourcePayload::Network(NetworkDetails {
            port_security_enabled: row.port_security_enabled,
        }))
    }
}

impl TryFrom<RouterRow> for TrackedResource {
    type Error = TrackerError;

    fn try_from(row: RouterRow) -> TrackerResult<Self> {
        row.base.into_tracked(ResourcePayload::Router(RouterDetails {
            external_gateway: row.external_gateway_info.map(|j| j.0),
        }))
    }
}

impl TryFrom<SubnetRow> for TrackedResource {
    type Error = TrackerError;

    fn try_from(row: SubnetRow) -> TrackerResult<Self> {
        row.base.into_tracked(ResourcePayload::Subnet(SubnetDetails {
            network_id: row.network_id,
            cidr: row.cidr,
            allocation_pools: row.allocation_pools.0,
        }))
    }
}

impl TryFrom<FloatingIpRow> for TrackedResource {
    type Error = TrackerError;

    fn try_from(row: FloatingIpRow) -> TrackerResult<Self> {
        row.base.into_tracked(ResourcePayload::FloatingIp(FloatingIpDetails {
            floating_ip_address: row.floating_ip_address,
            fixed_ip_address: row.fixed_ip_address,
            port_id: row.port_id,
            router_id: row.router_id,
            floating_network_id: row.floating_network_id,
        }))
    }
}

impl TryFrom<GpuLeaseRow> for TrackedResource {
    type Error = TrackerError;

    fn try_from(row: GpuLeaseRow) -> TrackerResult<Self> {
        row.base.into_tracked(ResourcePayload::GpuLease(LeaseDetails {
            user_id: row.user_id,
            project_id: row.project_id,
            start_date: row.start_date,
            end_date: row.end_date,
            degraded: row.degraded,
            trust_id: row.trust_id,
            reservations: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(site: &str) -> LifecycleColumns {
        LifecycleColumns {
            resource_id: "net-1".to_string(),
            resource_name: "sharednet1".to_string(),
            status: "ACTIVE".to_string(),
            project_site: site.to_string(),
            created_time: None,
            updated_time: None,
            last_seen_time: Utc::now(),
            first_time_not_seen: None,
        }
    }

    #[test]
    fn rows_convert_into_typed_records() {
        let tracked = TrackedResource::try_from(NetworkRow {
            base: base("CHI@UC"),
            port_security_enabled: Some(true),
        })
        .unwrap();
        assert_eq!(tracked.site, Site::ChiUc);
        assert_eq!(tracked.kind(), ResourceKind::Network);
        assert_eq!(tracked.key().to_string(), "CHI@UC/net-1");
    }

    #[test]
    fn unknown_site_in_a_row_is_a_validation_error() {
        let err = TrackedResource::try_from(NetworkRow {
            base: base("CHI@NOWHERE"),
            port_security_enabled: None,
        })
        .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Validation {
                kind: ResourceKind::Network,
                ..
            }
        ));
    }
}
