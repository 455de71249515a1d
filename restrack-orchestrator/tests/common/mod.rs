// Shared fixtures for the orchestrator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use restrack_common::payload::{
    ExternalGateway, FloatingIpDetails, LeaseDetails, NetworkDetails, RouterDetails, ServerAddress,
    ServerDetails, SubnetDetails,
};
use restrack_common::{
    ResourceKind, ResourcePayload, Site, SiteResourceId, TrackedResource, TrackerError,
    TrackerResult,
};
use restrack_orchestrator::migrations::MIGRATOR;
use restrack_orchestrator::terminator::DeletionLedger;
use restrack_providers::inventory::DiscoveredResource;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, Pool, Postgres};
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

/// A migrated connection to `TEST_DATABASE_URL`, or None when it is unset.
///
/// Each test opens its own connection and works inside a transaction it never
/// commits, so tests leave nothing behind and cannot see each other's rows.
pub async fn test_conn() -> Option<PgConnection> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping store test");
        return None;
    };
    let mut conn = PgConnection::connect(&url)
        .await
        .expect("Failed to connect to test database");
    MIGRATOR
        .run(&mut conn)
        .await
        .expect("Failed to run migrations on test database");
    Some(conn)
}

/// A migrated pool, for code paths that open and commit their own transactions.
/// Whatever such a test commits it must delete again.
pub async fn test_pool() -> Option<Pool<Postgres>> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping store test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    MIGRATOR
        .run(&pool)
        .await
        .expect("Failed to run migrations on test database");
    Some(pool)
}

/// Unique id so concurrent tests never collide on primary keys.
pub fn uid(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn payload(kind: ResourceKind) -> ResourcePayload {
    match kind {
        ResourceKind::Server => ResourcePayload::Server(ServerDetails::default()),
        ResourceKind::Network => ResourcePayload::Network(NetworkDetails::default()),
        ResourceKind::Router => ResourcePayload::Router(RouterDetails::default()),
        ResourceKind::Subnet => ResourcePayload::Subnet(SubnetDetails::default()),
        ResourceKind::FloatingIp => ResourcePayload::FloatingIp(FloatingIpDetails::default()),
        ResourceKind::GpuLease => ResourcePayload::GpuLease(LeaseDetails::default()),
    }
}

pub fn discovered(
    kind: ResourceKind,
    id: &str,
    name: &str,
    created: Option<DateTime<Utc>>,
) -> DiscoveredResource {
    DiscoveredResource {
        resource_id: id.to_string(),
        resource_name: name.to_string(),
        status: "ACTIVE".to_string(),
        created_time: created,
        updated_time: created,
        payload: payload(kind),
    }
}

pub fn tracked(site: Site, kind: ResourceKind, id: &str, created: DateTime<Utc>) -> TrackedResource {
    tracked_with(site, id, payload(kind), created)
}

pub fn tracked_with(
    site: Site,
    id: &str,
    payload: ResourcePayload,
    created: DateTime<Utc>,
) -> TrackedResource {
    TrackedResource {
        resource_id: id.to_string(),
        resource_name: format!("name-{}", id),
        status: "ACTIVE".to_string(),
        site,
        created_time: Some(created),
        updated_time: None,
        last_seen_time: created,
        first_time_not_seen: None,
        payload,
    }
}

pub fn server_with_floating_ip(address: &str) -> ResourcePayload {
    let mut details = ServerDetails::default();
    details.addresses.insert(
        "sharednet1".to_string(),
        vec![
            ServerAddress {
                addr: "10.140.0.7".to_string(),
                ip_type: Some("fixed".to_string()),
                version: Some(4),
            },
            ServerAddress {
                addr: address.to_string(),
                ip_type: Some("floating".to_string()),
                version: Some(4),
            },
        ],
    );
    ResourcePayload::Server(details)
}

pub fn router_with_gateway() -> ResourcePayload {
    ResourcePayload::Router(RouterDetails {
        external_gateway: Some(ExternalGateway {
            network_id: Some("public".to_string()),
            ..Default::default()
        }),
    })
}

/// In-memory ledger recording every bulk confirmation it receives.
#[derive(Default)]
pub struct RecordingLedger {
    calls: Mutex<Vec<(ResourceKind, Vec<SiteResourceId>)>>,
    failing: Mutex<HashSet<ResourceKind>>,
}

impl RecordingLedger {
    pub fn fail_for(&self, kind: ResourceKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn calls(&self) -> Vec<(ResourceKind, Vec<SiteResourceId>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeletionLedger for RecordingLedger {
    async fn confirm_deleted(&self, kind: ResourceKind, ids: &[SiteResourceId]) -> TrackerResult<u64> {
        self.calls.lock().unwrap().push((kind, ids.to_vec()));
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(TrackerError::Store(sqlx::Error::PoolTimedOut));
        }
        Ok(ids.len() as u64)
    }
}
