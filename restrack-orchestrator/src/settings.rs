//! Runtime configuration, read from the environment (after `.env`).

use restrack_common::{Site, TrackerError, TrackerResult};
use sqlx::postgres::PgConnectOptions;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::retirement::ProtectList;

/// Keystone application credential for one site.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub auth_url: String,
    pub id: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("auth_url", &self.auth_url)
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteCredentials {
    pub site: Site,
    pub compute: Credential,
    /// Separate reservation-service credential; the compute session is reused when absent.
    pub reservation: Option<Credential>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayBackend {
    OpenStack,
    Mock,
}

impl FromStr for GatewayBackend {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openstack" => Ok(Self::OpenStack),
            "mock" => Ok(Self::Mock),
            other => Err(TrackerError::Configuration(format!(
                "unknown RESTRACK_GATEWAY '{}' (expected openstack or mock)",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseSettings {
    Url(String),
    Parts {
        host: String,
        port: u16,
        name: String,
        user: String,
        password: Option<String>,
    },
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(_) => f.write_str("DatabaseSettings::Url(<redacted>)"),
            Self::Parts {
                host, port, name, user, ..
            } => write!(f, "DatabaseSettings::Parts({}@{}:{}/{})", user, host, port, name),
        }
    }
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> TrackerResult<PgConnectOptions> {
        match self {
            Self::Url(url) => PgConnectOptions::from_str(url)
                .map_err(|e| TrackerError::Configuration(format!("invalid DATABASE_URL: {}", e))),
            Self::Parts {
                host,
                port,
                name,
                user,
                password,
            } => {
                let mut opts = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .database(name)
                    .username(user);
                if let Some(pw) = password {
                    opts = opts.password(pw);
                }
                Ok(opts)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub max_connections: u32,
    pub gateway: GatewayBackend,
    pub sites: Vec<SiteCredentials>,
    pub protect: ProtectList,
    /// Set by `restrict_to`.
    pub only: Option<Site>,
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn credential_list(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
) -> TrackerResult<Vec<Credential>> {
    let url_key = format!("{}_AUTH_URL", prefix);
    let id_key = format!("{}_APPLICATION_CREDENTIAL_ID", prefix);
    let secret_key = format!("{}_APPLICATION_CREDENTIAL_SECRET", prefix);

    let urls = split_list(lookup(&url_key));
    let ids = split_list(lookup(&id_key));
    let secrets = split_list(lookup(&secret_key));

    if urls.len() != ids.len() || urls.len() != secrets.len() {
        return Err(TrackerError::Configuration(format!(
            "{}, {} and {} must list the same number of entries (got {}, {}, {})",
            url_key,
            id_key,
            secret_key,
            urls.len(),
            ids.len(),
            secrets.len()
        )));
    }

    Ok(urls
        .into_iter()
        .zip(ids)
        .zip(secrets)
        .map(|((auth_url, id), secret)| Credential {
            auth_url,
            id,
            secret,
        })
        .collect())
}

fn by_site(credentials: Vec<Credential>, label: &str) -> TrackerResult<BTreeMap<Site, Credential>> {
    let mut out = BTreeMap::new();
    for cred in credentials {
        let site = Site::from_auth_url(&cred.auth_url)?;
        if out.insert(site, cred).is_some() {
            return Err(TrackerError::Configuration(format!(
                "{} lists site {} more than once",
                label, site
            )));
        }
    }
    Ok(out)
}

impl Settings {
    pub fn from_env() -> TrackerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TrackerResult<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseSettings::Url(url),
            None => {
                let name = get("DB_NAME");
                let user = get("DB_USER");
                let (Some(name), Some(user)) = (name, user) else {
                    return Err(TrackerError::Configuration(
                        "set DATABASE_URL, or DB_NAME and DB_USER".to_string(),
                    ));
                };
                let port = match get("DB_PORT") {
                    Some(p) => p.parse::<u16>().map_err(|_| {
                        TrackerError::Configuration(format!("DB_PORT '{}' is not a valid port", p))
                    })?,
                    None => 5432,
                };
                DatabaseSettings::Parts {
                    host: get("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                    port,
                    name,
                    user,
                    password: get("DB_PASSWORD"),
                }
            }
        };

        let max_connections = match get("DB_MAX_CONNECTIONS") {
            Some(n) => n.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                TrackerError::Configuration(format!("DB_MAX_CONNECTIONS '{}' must be a positive integer", n))
            })?,
            None => 5,
        };

        let gateway = match get("RESTRACK_GATEWAY") {
            Some(raw) => raw.parse()?,
            None => GatewayBackend::OpenStack,
        };

        let compute = by_site(credential_list(&lookup, "OS")?, "OS_AUTH_URL")?;
        let mut reservation = by_site(credential_list(&lookup, "BLAZAR")?, "BLAZAR_AUTH_URL")?;
        if let Some(orphan) = reservation.keys().find(|s| !compute.contains_key(s)) {
            return Err(TrackerError::Configuration(format!(
                "BLAZAR credentials given for {} which has no OS credentials",
                orphan
            )));
        }
        let sites = compute
            .into_iter()
            .map(|(site, cred)| SiteCredentials {
                site,
                compute: cred,
                reservation: reservation.remove(&site),
            })
            .collect();

        let protect = ProtectList::new(
            lookup("PROTECTED_NETWORKS")
                .map(|v| split_list(Some(v)))
                .unwrap_or_else(|| ProtectList::default().networks),
            lookup("PROTECTED_SUBNETS")
                .map(|v| split_list(Some(v)))
                .unwrap_or_else(|| ProtectList::default().subnets),
        );

        Ok(Self {
            database,
            max_connections,
            gateway,
            sites,
            protect,
            only: None,
        })
    }

    /// Sites this run works on. The mock backend needs no credentials and
    /// falls back to every known site.
    pub fn site_list(&self) -> Vec<Site> {
        let all: Vec<Site> = if self.sites.is_empty() && self.gateway == GatewayBackend::Mock {
            Site::ALL.to_vec()
        } else {
            self.sites.iter().map(|s| s.site).collect()
        };
        all.into_iter()
            .filter(|s| self.only.map_or(true, |only| only == *s))
            .collect()
    }

    /// Keep only `site`, failing if it is not configured.
    pub fn restrict_to(&mut self, site: Option<Site>) -> TrackerResult<()> {
        let Some(site) = site else {
            return Ok(());
        };
        if !self.site_list().contains(&site) {
            return Err(TrackerError::Configuration(format!(
                "site {} is not configured",
                site
            )));
        }
        self.sites.retain(|s| s.site == site);
        self.only = Some(site);
        Ok(())
    }
}
