use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TrackerError;

/// One independently authenticated cloud deployment.
///
/// The set is closed: credentials whose auth endpoint does not resolve to one of
/// these sites are rejected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Site {
    ChiUc,
    ChiTacc,
    KvmTacc,
}

impl Site {
    pub const ALL: [Site; 3] = [Site::ChiUc, Site::ChiTacc, Site::KvmTacc];

    /// Value stored in the `project_site` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChiUc => "CHI@UC",
            Self::ChiTacc => "CHI@TACC",
            Self::KvmTacc => "KVM@TACC",
        }
    }

    pub fn auth_host(&self) -> &'static str {
        match self {
            Self::ChiUc => "chi.uc.chameleoncloud.org",
            Self::ChiTacc => "chi.tacc.chameleoncloud.org",
            Self::KvmTacc => "kvm.tacc.chameleoncloud.org",
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Self::ChiUc => "chi_uc",
            Self::ChiTacc => "chi_tacc",
            Self::KvmTacc => "kvm_tacc",
        }
    }

    /// Resolve the site that owns an authentication endpoint, by host name.
    pub fn from_auth_url(auth_url: &str) -> Result<Site, TrackerError> {
        let parsed = url::Url::parse(auth_url.trim()).map_err(|e| {
            TrackerError::Configuration(format!("invalid auth url '{}': {}", auth_url.trim(), e))
        })?;
        let host = parsed
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or_default();
        Site::ALL
            .into_iter()
            .find(|s| s.auth_host() == host)
            .ok_or_else(|| {
                TrackerError::Configuration(format!(
                    "auth url '{}' does not belong to a known site",
                    auth_url.trim()
                ))
            })
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Site {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let normalized = raw.to_ascii_lowercase().replace('-', "_");
        Site::ALL
            .into_iter()
            .find(|site| site.as_str().eq_ignore_ascii_case(raw) || site.variant_name() == normalized)
            .ok_or_else(|| format!("unknown site: {}", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_sites_from_auth_urls() {
        assert_eq!(
            Site::from_auth_url("https://chi.uc.chameleoncloud.org:5000/v3").unwrap(),
            Site::ChiUc
        );
        assert_eq!(
            Site::from_auth_url("https://CHI.TACC.chameleoncloud.org:5000/v3/").unwrap(),
            Site::ChiTacc
        );
        assert_eq!(
            Site::from_auth_url(" https://kvm.tacc.chameleoncloud.org:5000/v3 ").unwrap(),
            Site::KvmTacc
        );
    }

    #[test]
    fn unknown_endpoint_is_a_configuration_error() {
        let err = Site::from_auth_url("https://openstack.example.org:5000/v3").unwrap_err();
        assert!(matches!(err, TrackerError::Configuration(_)));
        assert!(Site::from_auth_url("not a url").is_err());
    }

    #[test]
    fn parses_column_values_and_variant_names() {
        for site in Site::ALL {
            assert_eq!(site.as_str().parse::<Site>(), Ok(site));
            assert_eq!(site.as_str().to_lowercase().parse::<Site>(), Ok(site));
        }
        assert_eq!("kvm-tacc".parse::<Site>(), Ok(Site::KvmTacc));
        assert_eq!("CHI_UC".parse::<Site>(), Ok(Site::ChiUc));
        assert!("CHI@NU".parse::<Site>().is_err());
    }
}
