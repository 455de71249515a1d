use chrono::{DateTime, Duration, Utc};
use restrack_common::{ResourceKind, Site, TrackedResource, TrackerError, TrackerResult};
use sqlx::{PgConnection, Pool, Postgres};
use std::collections::BTreeMap;

use crate::inventory_store as store;

/// Names never selected for retirement. Only networks and subnets have one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectList {
    pub networks: Vec<String>,
    pub subnets: Vec<String>,
}

impl Default for ProtectList {
    fn default() -> Self {
        Self {
            networks: vec!["public".to_string(), "sharednet1".to_string()],
            subnets: vec!["sharednet1-subnet".to_string()],
        }
    }
}

impl ProtectList {
    pub fn new(networks: Vec<String>, subnets: Vec<String>) -> Self {
        Self { networks, subnets }
    }

    pub fn names_for(&self, kind: ResourceKind) -> &[String] {
        match kind {
            ResourceKind::Network => &self.networks,
            ResourceKind::Subnet => &self.subnets,
            _ => &[],
        }
    }
}

/// Age threshold from the CLI's hour count. Anything below one hour is rejected.
pub fn age_from_hours(hours: i64) -> TrackerResult<Duration> {
    if hours < 1 {
        return Err(TrackerError::Configuration(format!(
            "age threshold must be a positive number of hours, got {}",
            hours
        )));
    }
    Duration::try_hours(hours).ok_or_else(|| {
        TrackerError::Configuration(format!("age threshold of {} hours is out of range", hours))
    })
}

pub fn cutoff(older_than: Duration, now: DateTime<Utc>) -> TrackerResult<DateTime<Utc>> {
    if older_than <= Duration::zero() {
        return Err(TrackerError::Configuration(
            "age threshold must be positive".to_string(),
        ));
    }
    now.checked_sub_signed(older_than).ok_or_else(|| {
        TrackerError::Configuration("age threshold reaches before the representable range".to_string())
    })
}

#[derive(Debug, Clone)]
pub struct RetirementRequest {
    pub older_than: Duration,
    pub kinds: Vec<ResourceKind>,
    pub site: Option<Site>,
}

/// Resources chosen for retirement, keyed by kind, oldest first within each kind.
/// The terminator decides the order in which kinds are deleted.
#[derive(Debug, Clone)]
pub struct Selection {
    pub cutoff: DateTime<Utc>,
    pub by_kind: BTreeMap<ResourceKind, Vec<TrackedResource>>,
}

impl Selection {
    pub fn new(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff,
            by_kind: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, resource: TrackedResource) {
        self.by_kind.entry(resource.kind()).or_default().push(resource);
    }

    pub fn resources(&self, kind: ResourceKind) -> &[TrackedResource] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Select still-present resources older than the threshold.
///
/// The threshold is validated before anything is read.
pub async fn select(
    conn: &mut PgConnection,
    request: &RetirementRequest,
    protect: &ProtectList,
    now: DateTime<Utc>,
) -> TrackerResult<Selection> {
    let cutoff = cutoff(request.older_than, now)?;
    let mut selection = Selection::new(cutoff);

    for &kind in &request.kinds {
        let found =
            store::select_stale(conn, kind, cutoff, request.site, protect.names_for(kind)).await?;
        tracing::info!(
            %kind,
            count = found.len(),
            cutoff = %cutoff,
            site = request.site.map(|s| s.as_str()).unwrap_or("all"),
            "selected for retirement"
        );
        selection.by_kind.insert(kind, found);
    }
    Ok(selection)
}

pub async fn select_from_pool(
    pool: &Pool<Postgres>,
    request: &RetirementRequest,
    protect: &ProtectList,
) -> TrackerResult<Selection> {
    let mut conn = pool.acquire().await?;
    select(&mut conn, request, protect, Utc::now()).await
}
