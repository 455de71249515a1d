use crate::inventory::{DiscoveredResource, Listing, MalformedItem, Port, PortFilter};
use crate::CloudGateway;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method};
use restrack_common::payload::*;
use restrack_common::{ResourceKind, ResourcePayload, Site};
use serde_json::{json, Value};
use std::time::Duration;

const MAX_PAGES: usize = 100;

/// Keystone v3 application credential.
#[derive(Clone, Debug)]
pub struct ApplicationCredential {
    pub auth_url: String,
    pub id: String,
    pub secret: String,
}

#[derive(Clone, Debug)]
struct Endpoint {
    url: String,
    token: String,
}

/// Nova + Neutron + Blazar behind one site's credentials.
pub struct OpenStackGateway {
    client: Client,
    site: Site,
    compute: Endpoint,
    network: Endpoint,
    reservation: Option<Endpoint>,
}

struct Catalog {
    token: String,
    body: Value,
}

impl Catalog {
    fn public_endpoint(&self, service_type: &str) -> Option<String> {
        self.body["token"]["catalog"]
            .as_array()?
            .iter()
            .filter(|svc| svc["type"].as_str() == Some(service_type))
            .flat_map(|svc| svc["endpoints"].as_array().cloned().unwrap_or_default())
            .find(|ep| ep["interface"].as_str() == Some("public"))
            .and_then(|ep| ep["url"].as_str().map(|u| u.trim_end_matches('/').to_string()))
    }

    fn endpoint(&self, service_type: &str) -> Option<Endpoint> {
        self.public_endpoint(service_type).map(|url| Endpoint {
            url,
            token: self.token.clone(),
        })
    }
}

async fn authenticate(client: &Client, credential: &ApplicationCredential) -> Result<Catalog> {
    let url = format!("{}/auth/tokens", credential.auth_url.trim().trim_end_matches('/'));
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["application_credential"],
                "application_credential": {
                    "id": credential.id,
                    "secret": credential.secret,
                }
            }
        }
    });
    let resp = client.post(&url).json(&body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!(
            "keystone authentication failed: status={} body={}",
            status.as_u16(),
            text
        ));
    }
    let token = resp
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("keystone response carried no X-Subject-Token"))?;
    let body: Value = resp.json().await?;
    Ok(Catalog { token, body })
}

impl OpenStackGateway {
    /// Authenticate against keystone and resolve the public compute, network and
    /// reservation endpoints. `reservation_credential` authenticates the
    /// reservation service separately when the site requires it.
    pub async fn connect(
        site: Site,
        credential: &ApplicationCredential,
        reservation_credential: Option<&ApplicationCredential>,
    ) -> Result<Self> {
        // Every call fails in bounded time.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;

        let catalog = authenticate(&client, credential)
            .await
            .with_context(|| format!("authenticating to {}", site))?;
        let compute = catalog
            .endpoint("compute")
            .ok_or_else(|| anyhow::anyhow!("{}: catalog has no public compute endpoint", site))?;
        let network = catalog
            .endpoint("network")
            .ok_or_else(|| anyhow::anyhow!("{}: catalog has no public network endpoint", site))?;

        let reservation = match reservation_credential {
            Some(cred) => authenticate(&client, cred)
                .await
                .with_context(|| format!("authenticating reservation service at {}", site))?
                .endpoint("reservation"),
            None => catalog.endpoint("reservation"),
        };
        if reservation.is_none() {
            tracing::warn!(%site, "no reservation endpoint in catalog; GPU leases will not be tracked");
        }

        Ok(Self {
            client,
            site,
            compute,
            network,
            reservation,
        })
    }

    fn network_path(&self, path: &str) -> String {
        if self.network.url.ends_with("/v2.0") {
            format!("{}{}", self.network.url, path)
        } else {
            format!("{}/v2.0{}", self.network.url, path)
        }
    }

    fn reservation(&self) -> Result<&Endpoint> {
        self.reservation
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{}: reservation service unavailable", self.site))
    }

    async fn request(
        &self,
        method: Method,
        token: &str,
        url: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value> {
        let mut req = self
            .client
            .request(method.clone(), url)
            .header("X-Auth-Token", token)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            tracing::debug!(site = %self.site, %method, url, status = status.as_u16(), "request failed");
            return Err(anyhow::anyhow!(
                "{} {} failed: status={} body={}",
                method,
                url,
                status.as_u16(),
                text
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("decoding response of {} {}", method, url))
    }

    /// GET a collection, following `<key>_links` next pointers. Fails rather than
    /// return a listing cut short by the page limit.
    async fn collect(&self, token: &str, url: &str, key: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        let mut page = self.request(Method::GET, token, url, query, None).await?;
        for _ in 0..MAX_PAGES {
            let items = page[key]
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("response of {} has no '{}' array", url, key))?;
            out.extend(items.iter().cloned());
            let next = page[format!("{}_links", key)]
                .as_array()
                .and_then(|links| {
                    links
                        .iter()
                        .find(|l| l["rel"].as_str() == Some("next"))
                        .and_then(|l| l["href"].as_str())
                })
                .map(|s| s.to_string());
            match next {
                Some(href) => page = self.request(Method::GET, token, &href, &[], None).await?,
                None => return Ok(out),
            }
        }
        // Never hand back a truncated listing.
        anyhow::bail!(
            "listing {} at {} exceeded {} pages ({} items so far)",
            url,
            self.site,
            MAX_PAGES,
            out.len()
        )
    }
}

#[async_trait]
impl CloudGateway for OpenStackGateway {
    fn site(&self) -> Site {
        self.site
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind != ResourceKind::GpuLease || self.reservation.is_some()
    }

    async fn list(&self, kind: ResourceKind) -> Result<Listing> {
        let net = |path: &str| self.network_path(path);
        let raw = match kind {
            ResourceKind::Server => {
                let url = format!("{}/servers/detail", self.compute.url);
                self.collect(&self.compute.token, &url, "servers", &[]).await?
            }
            ResourceKind::Network => {
                self.collect(&self.network.token, &net("/networks"), "networks", &[])
                    .await?
            }
            ResourceKind::Router => {
                self.collect(&self.network.token, &net("/routers"), "routers", &[])
                    .await?
            }
            ResourceKind::Subnet => {
                self.collect(&self.network.token, &net("/subnets"), "subnets", &[])
                    .await?
            }
            ResourceKind::FloatingIp => {
                self.collect(&self.network.token, &net("/floatingips"), "floatingips", &[])
                    .await?
            }
            ResourceKind::GpuLease => {
                let ep = self.reservation()?;
                self.collect(&ep.token, &format!("{}/leases", ep.url), "leases", &[])
                    .await?
            }
        };

        let parse = parser_for(kind);
        let mut listing = Listing::default();
        for value in &raw {
            match parse(value) {
                Ok(item) => listing.items.push(item),
                Err(bad) => listing.malformed.push(bad),
            }
        }
        Ok(listing)
    }

    async fn delete(&self, kind: ResourceKind, resource_id: &str) -> Result<()> {
        let (token, url) = match kind {
            ResourceKind::Server => (
                &self.compute.token,
                format!("{}/servers/{}", self.compute.url, resource_id),
            ),
            ResourceKind::Network => (
                &self.network.token,
                self.network_path(&format!("/networks/{}", resource_id)),
            ),
            ResourceKind::Router => (
                &self.network.token,
                self.network_path(&format!("/routers/{}", resource_id)),
            ),
            ResourceKind::Subnet => (
                &self.network.token,
                self.network_path(&format!("/subnets/{}", resource_id)),
            ),
            ResourceKind::FloatingIp => (
                &self.network.token,
                self.network_path(&format!("/floatingips/{}", resource_id)),
            ),
            ResourceKind::GpuLease => {
                let ep = self.reservation()?;
                (&ep.token, format!("{}/leases/{}", ep.url, resource_id))
            }
        };
        self.request(Method::DELETE, token, &url, &[], None).await?;
        Ok(())
    }

    async fn list_ports(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        let query = match filter {
            PortFilter::Network(id) => [("network_id", id.as_str())],
            PortFilter::Device(id) => [("device_id", id.as_str())],
        };
        let raw = self
            .collect(&self.network.token, &self.network_path("/ports"), "ports", &query)
            .await?;
        Ok(raw.iter().filter_map(parse_port).collect())
    }

    async fn delete_port(&self, port_id: &str) -> Result<()> {
        let url = self.network_path(&format!("/ports/{}", port_id));
        self.request(Method::DELETE, &self.network.token, &url, &[], None)
            .await?;
        Ok(())
    }

    async fn clear_gateway(&self, router_id: &str) -> Result<()> {
        let url = self.network_path(&format!("/routers/{}", router_id));
        let body = json!({ "router": { "external_gateway_info": {} } });
        self.request(Method::PUT, &self.network.token, &url, &[], Some(body))
            .await?;
        Ok(())
    }

    async fn detach_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let url = self.network_path(&format!("/routers/{}/remove_router_interface", router_id));
        let body = json!({ "subnet_id": subnet_id });
        self.request(Method::PUT, &self.network.token, &url, &[], Some(body))
            .await?;
        Ok(())
    }

    async fn release_floating_ip(&self, address: &str) -> Result<bool> {
        let matches = self
            .collect(
                &self.network.token,
                &self.network_path("/floatingips"),
                "floatingips",
                &[("floating_ip_address", address)],
            )
            .await?;
        let Some(id) = matches
            .iter()
            .filter(|ip| ip["floating_ip_address"].as_str() == Some(address))
            .find_map(|ip| ip["id"].as_str())
        else {
            return Ok(false);
        };
        let url = self.network_path(&format!("/floatingips/{}", id));
        self.request(Method::DELETE, &self.network.token, &url, &[], None)
            .await?;
        Ok(true)
    }
}

// --- Payload normalization ---

type Parser = fn(&Value) -> Result<DiscoveredResource, MalformedItem>;

fn parser_for(kind: ResourceKind) -> Parser {
    match kind {
        ResourceKind::Server => parse_server,
        ResourceKind::Network => parse_network,
        ResourceKind::Router => parse_router,
        ResourceKind::Subnet => parse_subnet,
        ResourceKind::FloatingIp => parse_floating_ip,
        ResourceKind::GpuLease => parse_lease,
    }
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DD[T ]HH:MM:SS[.ffffff]` form (read as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("unparseable timestamp '{}'", s))
}

fn opt_string(v: &Value) -> Option<String> {
    v.as_str().filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn opt_timestamp(v: &Value, field: &str, id: &str) -> Result<Option<DateTime<Utc>>, MalformedItem> {
    match v[field].as_str().filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_timestamp(raw).map(Some).map_err(|reason| MalformedItem {
            resource_id: Some(id.to_string()),
            reason: format!("{}: {}", field, reason),
        }),
    }
}

fn required_id(v: &Value) -> Result<String, MalformedItem> {
    opt_string(&v["id"]).ok_or_else(|| MalformedItem {
        resource_id: None,
        reason: "missing id".to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned + Default>(v: &Value, field: &str, id: &str) -> Result<T, MalformedItem> {
    if v[field].is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(v[field].clone()).map_err(|e| MalformedItem {
        resource_id: Some(id.to_string()),
        reason: format!("{}: {}", field, e),
    })
}

/// Integer that some APIs send as a string.
fn loose_i32(v: &Value, default: i32) -> i32 {
    v.as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(default)
}

fn common(
    v: &Value,
    created_field: &str,
    updated_field: &str,
    default_status: &str,
    payload: impl FnOnce(&str) -> Result<ResourcePayload, MalformedItem>,
) -> Result<DiscoveredResource, MalformedItem> {
    let id = required_id(v)?;
    Ok(DiscoveredResource {
        resource_name: v["name"].as_str().unwrap_or_default().to_string(),
        status: opt_string(&v["status"]).unwrap_or_else(|| default_status.to_string()),
        created_time: opt_timestamp(v, created_field, &id)?,
        updated_time: opt_timestamp(v, updated_field, &id)?,
        payload: payload(&id)?,
        resource_id: id,
    })
}

pub fn parse_server(v: &Value) -> Result<DiscoveredResource, MalformedItem> {
    common(v, "created", "updated", "UNKNOWN", |id| {
        let flavor = opt_string(&v["flavor"]["id"]).or_else(|| opt_string(&v["flavor"]["original_name"]));
        // Volume-backed servers report image as an empty string.
        let image = opt_string(&v["image"]["id"]);
        let security_groups = v["security_groups"]
            .as_array()
            .map(|sgs| sgs.iter().filter_map(|sg| opt_string(&sg["name"])).collect())
            .unwrap_or_default();
        Ok(ResourcePayload::Server(ServerDetails {
            flavor,
            image,
            security_groups,
            addresses: decode(v, "addresses", id)?,
        }))
    })
}

pub fn parse_network(v: &Value) -> Result<DiscoveredResource, MalformedItem> {
    common(v, "created_at", "updated_at", "UNKNOWN", |_| {
        Ok(ResourcePayload::Network(NetworkDetails {
            port_security_enabled: v["port_security_enabled"].as_bool(),
        }))
    })
}

pub fn parse_router(v: &Value) -> Result<DiscoveredResource, MalformedItem> {
    common(v, "created_at", "updated_at", "UNKNOWN", |id| {
        let external_gateway = if v["external_gateway_info"].is_object() {
            Some(decode::<ExternalGateway>(v, "external_gateway_info", id)?)
        } else {
            None
        };
        Ok(ResourcePayload::Router(RouterDetails { external_gateway }))
    })
}

pub fn parse_subnet(v: &Value) -> Result<DiscoveredResource, MalformedItem> {
    // Subnets carry no status of their own.
    common(v, "created_at", "updated_at", "ACTIVE", |id| {
        Ok(ResourcePayload::Subnet(SubnetDetails {
            network_id: opt_string(&v["network_id"]),
            cidr: opt_string(&v["cidr"]),
            allocation_pools: decode(v, "allocation_pools", id)?,
        }))
    })
}

pub fn parse_floating_ip(v: &Value) -> Result<DiscoveredResource, MalformedItem> {
    let mut item = common(v, "created_at", "updated_at", "UNKNOWN", |_| {
        Ok(ResourcePayload::FloatingIp(FloatingIpDetails {
            floating_ip_address: opt_string(&v["floating_ip_address"]),
            fixed_ip_address: opt_string(&v["fixed_ip_address"]),
            port_id: opt_string(&v["port_id"]),
            router_id: opt_string(&v["router_id"]),
            floating_network_id: opt_string(&v["floating_network_id"]),
        }))
    })?;
    // Floating IPs are unnamed; the address is what operators recognise.
    if item.resource_name.is_empty() {
        item.resource_name = v["floating_ip_address"].as_str().unwrap_or_default().to_string();
    }
    Ok(item)
}

fn parse_reservation(v: &Value, lease_id: &str) -> Result<LeaseReservation, MalformedItem> {
    let reservation_id = opt_string(&v["id"]).ok_or_else(|| MalformedItem {
        resource_id: Some(lease_id.to_string()),
        reason: "reservation without id".to_string(),
    })?;
    Ok(LeaseReservation {
        resource_id: opt_string(&v["resource_id"]),
        resource_type: opt_string(&v["resource_type"]),
        status: opt_string(&v["status"]).unwrap_or_else(|| "UNKNOWN".to_string()),
        created_time: opt_timestamp(v, "created_at", lease_id)?,
        updated_time: opt_timestamp(v, "updated_at", lease_id)?,
        missing_resources: v["missing_resources"].as_bool().unwrap_or(false),
        resources_changed: v["resources_changed"].as_bool().unwrap_or(false),
        resource_properties: v
            .get("resource_properties")
            .cloned()
            .unwrap_or_else(|| json!({})),
        network_id: opt_string(&v["network_id"]),
        min_hosts: loose_i32(&v["min"], 1),
        max_hosts: loose_i32(&v["max"], 1),
        reservation_id,
    })
}

pub fn parse_lease(v: &Value) -> Result<DiscoveredResource, MalformedItem> {
    common(v, "created_at", "updated_at", "UNKNOWN", |id| {
        let reservations = v["reservations"]
            .as_array()
            .map(|rs| rs.iter().map(|r| parse_reservation(r, id)).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        Ok(ResourcePayload::GpuLease(LeaseDetails {
            user_id: opt_string(&v["user_id"]),
            project_id: opt_string(&v["project_id"]),
            start_date: opt_timestamp(v, "start_date", id)?,
            end_date: opt_timestamp(v, "end_date", id)?,
            degraded: v["degraded"].as_bool().unwrap_or(false),
            trust_id: opt_string(&v["trust_id"]),
            reservations,
        }))
    })
}

fn parse_port(v: &Value) -> Option<Port> {
    Some(Port {
        port_id: opt_string(&v["id"])?,
        network_id: opt_string(&v["network_id"]),
        device_id: opt_string(&v["device_id"]),
        device_owner: opt_string(&v["device_owner"]),
        subnet_ids: v["fixed_ips"]
            .as_array()
            .map(|ips| ips.iter().filter_map(|ip| opt_string(&ip["subnet_id"])).collect())
            .unwrap_or_default(),
    })
}
