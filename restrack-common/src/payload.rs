//! Kind-specific payloads carried by discovered and tracked resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ResourceKind;

/// One entry of a server's per-network address list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerAddress {
    pub addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default, skip_serializing_if = "Option::is_none")]
    pub ip_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
}

impl ServerAddress {
    pub fn is_floating(&self) -> bool {
        self.ip_type.as_deref() == Some("floating")
    }
}

/// Network name -> addresses, as reported by the compute API.
pub type AddressMap = BTreeMap<String, Vec<ServerAddress>>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerDetails {
    pub flavor: Option<String>,
    pub image: Option<String>,
    pub security_groups: Vec<String>,
    pub addresses: AddressMap,
}

impl ServerDetails {
    /// Floating addresses bound to this server, in address-map order.
    pub fn floating_addresses(&self) -> Vec<&str> {
        self.addresses
            .values()
            .flatten()
            .filter(|a| a.is_floating() && !a.addr.is_empty())
            .map(|a| a.addr.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkDetails {
    pub port_security_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalFixedIp {
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalGateway {
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub enable_snat: Option<bool>,
    #[serde(default)]
    pub external_fixed_ips: Vec<ExternalFixedIp>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouterDetails {
    pub external_gateway: Option<ExternalGateway>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationPool {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubnetDetails {
    pub network_id: Option<String>,
    pub cidr: Option<String>,
    pub allocation_pools: Vec<AllocationPool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FloatingIpDetails {
    pub floating_ip_address: Option<String>,
    pub fixed_ip_address: Option<String>,
    pub port_id: Option<String>,
    pub router_id: Option<String>,
    pub floating_network_id: Option<String>,
}

/// A per-resource reservation nested inside a GPU lease.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeaseReservation {
    pub reservation_id: String,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub status: String,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub missing_resources: bool,
    pub resources_changed: bool,
    pub resource_properties: serde_json::Value,
    pub network_id: Option<String>,
    pub min_hosts: i32,
    pub max_hosts: i32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeaseDetails {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub trust_id: Option<String>,
    /// Populated on discovery; empty on rows loaded for retirement.
    pub reservations: Vec<LeaseReservation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourcePayload {
    Server(ServerDetails),
    Network(NetworkDetails),
    Router(RouterDetails),
    Subnet(SubnetDetails),
    FloatingIp(FloatingIpDetails),
    GpuLease(LeaseDetails),
}

impl ResourcePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Server(_) => ResourceKind::Server,
            Self::Network(_) => ResourceKind::Network,
            Self::Router(_) => ResourceKind::Router,
            Self::Subnet(_) => ResourceKind::Subnet,
            Self::FloatingIp(_) => ResourceKind::FloatingIp,
            Self::GpuLease(_) => ResourceKind::GpuLease,
        }
    }
}
