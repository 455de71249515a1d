use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The resource kinds tracked in the inventory, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Server,
    Network,
    Router,
    Subnet,
    FloatingIp,
    GpuLease,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Server,
        ResourceKind::Network,
        ResourceKind::Router,
        ResourceKind::Subnet,
        ResourceKind::FloatingIp,
        ResourceKind::GpuLease,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Network => "network",
            Self::Router => "router",
            Self::Subnet => "subnet",
            Self::FloatingIp => "floating_ip",
            Self::GpuLease => "gpu_lease",
        }
    }

    /// Plural label used in summaries and the dry-run preview.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Server => "servers",
            Self::Network => "networks",
            Self::Router => "routers",
            Self::Subnet => "subnets",
            Self::FloatingIp => "floating_ips",
            Self::GpuLease => "gpu_leases",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized || k.plural() == normalized)
            .ok_or_else(|| format!("unknown resource kind: {}", s.trim()))
    }
}

/// A `--kind` argument: either one kind or every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindSelection {
    All,
    One(ResourceKind),
}

impl FromStr for KindSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(KindSelection::All);
        }
        s.parse().map(KindSelection::One)
    }
}

/// Expand a list of selections into a deduplicated list of kinds, in the canonical order.
/// An empty list means every kind.
pub fn expand_selection(selections: &[KindSelection]) -> Vec<ResourceKind> {
    if selections.is_empty() || selections.contains(&KindSelection::All) {
        return ResourceKind::ALL.to_vec();
    }
    ResourceKind::ALL
        .into_iter()
        .filter(|k| selections.contains(&KindSelection::One(*k)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse_roundtrip() {
        for k in ResourceKind::ALL {
            assert_eq!(k.as_str().parse::<ResourceKind>(), Ok(k));
            assert_eq!(k.plural().parse::<ResourceKind>(), Ok(k));
            assert_eq!(k.as_str().to_uppercase().parse::<ResourceKind>(), Ok(k));
        }
        assert_eq!("floating-ip".parse::<ResourceKind>(), Ok(ResourceKind::FloatingIp));
        assert!("volume".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn selection_expansion() {
        assert_eq!(expand_selection(&[]), ResourceKind::ALL.to_vec());
        assert_eq!(
            expand_selection(&[KindSelection::One(ResourceKind::Subnet), KindSelection::All]),
            ResourceKind::ALL.to_vec()
        );
        assert_eq!(
            expand_selection(&[
                KindSelection::One(ResourceKind::Subnet),
                KindSelection::One(ResourceKind::Server),
                KindSelection::One(ResourceKind::Subnet),
            ]),
            vec![ResourceKind::Server, ResourceKind::Subnet]
        );
        assert_eq!("ALL".parse::<KindSelection>(), Ok(KindSelection::All));
    }
}
