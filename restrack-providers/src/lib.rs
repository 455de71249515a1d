use anyhow::Result;
use async_trait::async_trait;
use restrack_common::{ResourceKind, Site};

/// One authenticated connection to a site's control plane.
///
/// Implementations enforce their own request timeouts; every call either
/// completes or fails in bounded time.
#[async_trait]
pub trait CloudGateway: Send + Sync {
    /// The site this gateway is authenticated against.
    fn site(&self) -> Site;

    /// Whether the site exposes a listing for this kind at all.
    /// Default: every kind is available.
    fn supports(&self, _kind: ResourceKind) -> bool {
        true
    }

    /// Live listing of one kind. Objects that cannot be interpreted are reported
    /// in `Listing::malformed` instead of failing the call.
    async fn list(&self, kind: ResourceKind) -> Result<inventory::Listing>;

    async fn delete(&self, kind: ResourceKind, resource_id: &str) -> Result<()>;

    // Auxiliary calls used while retiring resources.
    async fn list_ports(&self, filter: &inventory::PortFilter) -> Result<Vec<inventory::Port>>;
    async fn delete_port(&self, port_id: &str) -> Result<()>;
    async fn clear_gateway(&self, router_id: &str) -> Result<()>;
    async fn detach_interface(&self, router_id: &str, subnet_id: &str) -> Result<()>;

    /// Release the floating IP holding `address`. Ok(false) when no such IP exists.
    async fn release_floating_ip(&self, address: &str) -> Result<bool>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use restrack_common::{ResourceKind, ResourcePayload};

    /// A provider object, normalized.
    #[derive(Clone, Debug, PartialEq)]
    pub struct DiscoveredResource {
        pub resource_id: String,
        pub resource_name: String,
        pub status: String,
        pub created_time: Option<DateTime<Utc>>,
        pub updated_time: Option<DateTime<Utc>>,
        pub payload: ResourcePayload,
    }

    impl DiscoveredResource {
        pub fn kind(&self) -> ResourceKind {
            self.payload.kind()
        }
    }

    /// A provider object that could not be normalized.
    #[derive(Clone, Debug, PartialEq)]
    pub struct MalformedItem {
        pub resource_id: Option<String>,
        pub reason: String,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct Listing {
        pub items: Vec<DiscoveredResource>,
        pub malformed: Vec<MalformedItem>,
    }

    impl Listing {
        pub fn new(items: Vec<DiscoveredResource>) -> Self {
            Self {
                items,
                malformed: Vec::new(),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub enum PortFilter {
        Network(String),
        Device(String),
    }

    pub const ROUTER_INTERFACE_OWNER: &str = "network:router_interface";
    pub const DHCP_OWNER: &str = "network:dhcp";

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Port {
        pub port_id: String,
        pub network_id: Option<String>,
        pub device_id: Option<String>,
        pub device_owner: Option<String>,
        pub subnet_ids: Vec<String>,
    }

    impl Port {
        pub fn is_router_interface(&self) -> bool {
            self.device_owner.as_deref() == Some(ROUTER_INTERFACE_OWNER)
        }

        pub fn is_dhcp(&self) -> bool {
            self.device_owner.as_deref() == Some(DHCP_OWNER)
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "openstack")]
pub mod openstack;
