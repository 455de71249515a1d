//! Domain types shared by the gateway implementations and the orchestrator.

pub mod error;
pub mod kind;
pub mod payload;
pub mod records;
pub mod site;

pub use error::{TrackerError, TrackerResult};
pub use kind::{expand_selection, KindSelection, ResourceKind};
pub use payload::ResourcePayload;
pub use records::{SiteResourceId, TrackedResource};
pub use site::Site;
