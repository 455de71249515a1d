use restrack_common::{Site, TrackerError, TrackerResult};
use restrack_providers::CloudGateway;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::settings::{GatewayBackend, Settings};

/// One authenticated gateway per site, keyed by the closed `Site` enum.
#[derive(Clone, Default)]
pub struct SiteGateways {
    gateways: BTreeMap<Site, Arc<dyn CloudGateway>>,
}

impl SiteGateways {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway under the site it reports. A site may only appear once.
    pub fn insert(&mut self, gateway: Arc<dyn CloudGateway>) -> TrackerResult<()> {
        let site = gateway.site();
        if self.gateways.contains_key(&site) {
            return Err(TrackerError::Configuration(format!(
                "more than one gateway for site {}",
                site
            )));
        }
        self.gateways.insert(site, gateway);
        Ok(())
    }

    pub fn get(&self, site: Site) -> Option<&Arc<dyn CloudGateway>> {
        self.gateways.get(&site)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Site, &Arc<dyn CloudGateway>)> {
        self.gateways.iter()
    }

    pub fn sites(&self) -> Vec<Site> {
        self.gateways.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

/// Gateways that came up, plus the sites that could not be reached.
pub struct GatewayConnections {
    pub gateways: SiteGateways,
    pub failures: Vec<(Site, TrackerError)>,
}

pub struct ProviderManager;

impl ProviderManager {
    /// Build one gateway per configured site with the configured backend.
    ///
    /// Configuration problems fail the whole call. A site whose authentication
    /// fails is reported in `failures` so the other sites can still run.
    pub async fn connect(settings: &Settings) -> TrackerResult<GatewayConnections> {
        match settings.gateway {
            GatewayBackend::OpenStack => Self::connect_openstack(settings).await,
            GatewayBackend::Mock => Self::mock(settings),
        }
    }

    #[cfg(feature = "provider-openstack")]
    async fn connect_openstack(settings: &Settings) -> TrackerResult<GatewayConnections> {
        use restrack_providers::openstack::{ApplicationCredential, OpenStackGateway};

        if settings.sites.is_empty() {
            return Err(TrackerError::Configuration(
                "no sites configured: set OS_AUTH_URL, OS_APPLICATION_CREDENTIAL_ID and OS_APPLICATION_CREDENTIAL_SECRET".to_string(),
            ));
        }

        let to_app_cred = |c: &crate::settings::Credential| ApplicationCredential {
            auth_url: c.auth_url.clone(),
            id: c.id.clone(),
            secret: c.secret.clone(),
        };

        let mut out = GatewayConnections {
            gateways: SiteGateways::new(),
            failures: Vec::new(),
        };
        for creds in &settings.sites {
            let compute = to_app_cred(&creds.compute);
            let reservation = creds.reservation.as_ref().map(to_app_cred);
            match OpenStackGateway::connect(creds.site, &compute, reservation.as_ref()).await {
                Ok(gw) => {
                    tracing::info!(site = %creds.site, "🔌 gateway authenticated");
                    out.gateways.insert(Arc::new(gw))?;
                }
                Err(e) => {
                    let err = TrackerError::gateway(creds.site, "authenticate", e);
                    tracing::error!(site = %creds.site, error = %err, "gateway unavailable");
                    out.failures.push((creds.site, err));
                }
            }
        }
        Ok(out)
    }

    #[cfg(not(feature = "provider-openstack"))]
    async fn connect_openstack(_settings: &Settings) -> TrackerResult<GatewayConnections> {
        Err(TrackerError::Configuration(
            "RESTRACK_GATEWAY=openstack but this build lacks the provider-openstack feature".to_string(),
        ))
    }

    /// Empty in-memory gateways, for dry runs of the whole pipeline.
    #[cfg(feature = "provider-mock")]
    fn mock(settings: &Settings) -> TrackerResult<GatewayConnections> {
        use restrack_providers::mock::MockGateway;

        let mut gateways = SiteGateways::new();
        for site in settings.site_list() {
            gateways.insert(Arc::new(MockGateway::new(site)))?;
        }
        tracing::warn!(sites = gateways.len(), "using in-memory mock gateways");
        Ok(GatewayConnections {
            gateways,
            failures: Vec::new(),
        })
    }

    #[cfg(not(feature = "provider-mock"))]
    fn mock(_settings: &Settings) -> TrackerResult<GatewayConnections> {
        Err(TrackerError::Configuration(
            "RESTRACK_GATEWAY=mock but this build lacks the provider-mock feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restrack_providers::mock::MockGateway;

    #[test]
    fn duplicate_sites_are_rejected() {
        let mut gateways = SiteGateways::new();
        gateways
            .insert(Arc::new(MockGateway::new(Site::ChiUc)))
            .unwrap();
        gateways
            .insert(Arc::new(MockGateway::new(Site::KvmTacc)))
            .unwrap();
        let err = gateways
            .insert(Arc::new(MockGateway::new(Site::ChiUc)))
            .unwrap_err();
        assert!(matches!(err, TrackerError::Configuration(_)));
        assert_eq!(gateways.sites(), vec![Site::ChiUc, Site::KvmTacc]);
    }
}
