use crate::inventory::{DiscoveredResource, Listing, MalformedItem, Port, PortFilter};
use crate::CloudGateway;
use anyhow::Result;
use async_trait::async_trait;
use restrack_common::{ResourceKind, Site};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Every call made against a [`MockGateway`], in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCall {
    List(ResourceKind),
    Delete(ResourceKind, String),
    ListPorts(PortFilter),
    DeletePort(String),
    ClearGateway(String),
    DetachInterface { router_id: String, subnet_id: String },
    ReleaseFloatingIp(String),
}

impl GatewayCall {
    /// True for calls that change provider-side state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, GatewayCall::List(_) | GatewayCall::ListPorts(_))
    }
}

#[derive(Default)]
struct MockState {
    listings: HashMap<ResourceKind, Vec<DiscoveredResource>>,
    malformed: HashMap<ResourceKind, Vec<MalformedItem>>,
    ports: Vec<Port>,
    floating_addresses: HashSet<String>,
    failing_ids: HashSet<String>,
    failing_lists: HashSet<ResourceKind>,
    unsupported: HashSet<ResourceKind>,
    calls: Vec<GatewayCall>,
}

/// In-memory gateway for one site.
///
/// Deletes remove the resource from later listings, so a reconciliation pass
/// after a retirement run observes the absence.
pub struct MockGateway {
    site: Site,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(site: Site) -> Self {
        Self {
            site,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded calls from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a resource to the live listing, replacing any entry with the same id.
    pub fn put(&self, resource: DiscoveredResource) {
        let mut state = self.state();
        let items = state.listings.entry(resource.kind()).or_default();
        match items.iter_mut().find(|r| r.resource_id == resource.resource_id) {
            Some(existing) => *existing = resource,
            None => items.push(resource),
        }
    }

    pub fn with(self, resources: impl IntoIterator<Item = DiscoveredResource>) -> Self {
        for r in resources {
            self.put(r);
        }
        self
    }

    /// Drop a resource from the live listing without recording a call (external deletion).
    pub fn vanish(&self, kind: ResourceKind, resource_id: &str) {
        let mut state = self.state();
        if let Some(items) = state.listings.get_mut(&kind) {
            items.retain(|r| r.resource_id != resource_id);
        }
    }

    pub fn add_malformed(&self, kind: ResourceKind, item: MalformedItem) {
        self.state().malformed.entry(kind).or_default().push(item);
    }

    pub fn add_port(&self, port: Port) {
        self.state().ports.push(port);
    }

    pub fn add_floating_address(&self, address: &str) {
        self.state().floating_addresses.insert(address.to_string());
    }

    /// Any mutation targeting this id (resource, port, subnet or address) fails.
    /// Use `gateway:<router_id>` to fail only the gateway clear of a router.
    pub fn fail_on(&self, id: &str) {
        self.state().failing_ids.insert(id.to_string());
    }

    pub fn fail_listing(&self, kind: ResourceKind) {
        self.state().failing_lists.insert(kind);
    }

    pub fn mark_unsupported(&self, kind: ResourceKind) {
        self.state().unsupported.insert(kind);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<GatewayCall> {
        self.calls().into_iter().filter(|c| c.is_mutation()).collect()
    }

    pub fn remaining(&self, kind: ResourceKind) -> Vec<String> {
        self.state()
            .listings
            .get(&kind)
            .map(|items| items.iter().map(|r| r.resource_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn remaining_ports(&self) -> Vec<String> {
        self.state().ports.iter().map(|p| p.port_id.clone()).collect()
    }

    fn record(&self, call: GatewayCall) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    fn check_failure(state: &MockState, id: &str, what: &str) -> Result<()> {
        if state.failing_ids.contains(id) {
            return Err(anyhow::anyhow!("MockGateway: {} {} failed (injected)", what, id));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudGateway for MockGateway {
    fn site(&self) -> Site {
        self.site
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        !self.state().unsupported.contains(&kind)
    }

    async fn list(&self, kind: ResourceKind) -> Result<Listing> {
        let state = self.record(GatewayCall::List(kind));
        if state.failing_lists.contains(&kind) {
            return Err(anyhow::anyhow!(
                "MockGateway: listing {} at {} failed (injected)",
                kind.plural(),
                self.site
            ));
        }
        Ok(Listing {
            items: state.listings.get(&kind).cloned().unwrap_or_default(),
            malformed: state.malformed.get(&kind).cloned().unwrap_or_default(),
        })
    }

    async fn delete(&self, kind: ResourceKind, resource_id: &str) -> Result<()> {
        let mut state = self.record(GatewayCall::Delete(kind, resource_id.to_string()));
        Self::check_failure(&state, resource_id, kind.as_str())?;
        let items = state.listings.entry(kind).or_default();
        let before = items.len();
        items.retain(|r| r.resource_id != resource_id);
        if items.len() == before {
            return Err(anyhow::anyhow!(
                "MockGateway: {} {} not found",
                kind.as_str(),
                resource_id
            ));
        }
        Ok(())
    }

    async fn list_ports(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        let state = self.record(GatewayCall::ListPorts(filter.clone()));
        Ok(state
            .ports
            .iter()
            .filter(|p| match filter {
                PortFilter::Network(id) => p.network_id.as_deref() == Some(id.as_str()),
                PortFilter::Device(id) => p.device_id.as_deref() == Some(id.as_str()),
            })
            .cloned()
            .collect())
    }

    async fn delete_port(&self, port_id: &str) -> Result<()> {
        let mut state = self.record(GatewayCall::DeletePort(port_id.to_string()));
        Self::check_failure(&state, port_id, "port")?;
        state.ports.retain(|p| p.port_id != port_id);
        Ok(())
    }

    async fn clear_gateway(&self, router_id: &str) -> Result<()> {
        let state = self.record(GatewayCall::ClearGateway(router_id.to_string()));
        Self::check_failure(&state, &format!("gateway:{}", router_id), "clear gateway")
    }

    async fn detach_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let mut state = self.record(GatewayCall::DetachInterface {
            router_id: router_id.to_string(),
            subnet_id: subnet_id.to_string(),
        });
        Self::check_failure(&state, subnet_id, "detach interface")?;
        state.ports.retain(|p| {
            !(p.is_router_interface()
                && p.device_id.as_deref() == Some(router_id)
                && p.subnet_ids.iter().any(|s| s == subnet_id))
        });
        Ok(())
    }

    async fn release_floating_ip(&self, address: &str) -> Result<bool> {
        let mut state = self.record(GatewayCall::ReleaseFloatingIp(address.to_string()));
        Self::check_failure(&state, address, "release floating ip")?;
        Ok(state.floating_addresses.remove(address))
    }
}
