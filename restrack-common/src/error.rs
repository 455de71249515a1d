//! Error taxonomy shared by the tracker and the cleanup run.

use thiserror::Error;

use crate::{ResourceKind, Site};

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Unresolvable site, missing credentials or invalid input. Raised before any pass starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("gateway error at {site} during {operation}: {source:#}")]
    Gateway {
        site: Site,
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("inventory store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A single malformed provider object. Never aborts a whole pass.
    #[error("invalid {kind} payload{}: {reason}", .resource_id.as_deref().map(|id| format!(" ({})", id)).unwrap_or_default())]
    Validation {
        kind: ResourceKind,
        resource_id: Option<String>,
        reason: String,
    },
}

impl TrackerError {
    pub fn gateway(site: Site, operation: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Gateway {
            site,
            operation: operation.into(),
            source,
        }
    }
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
