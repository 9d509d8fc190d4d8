//! # Data Models
//!
//! This module contains all the data models used throughout the sitelink
//! service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod consent_session;
pub mod site;
pub mod user_site;
pub mod user_site_lock;

pub use consent_session::Entity as ConsentSession;
pub use site::Entity as Site;
pub use user_site::Entity as UserSite;
pub use user_site_lock::Entity as UserSiteLock;

/// What kicked off a lifecycle operation. Batches larger than one connection
/// are only legal for the scheduled and flywheel variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CreateUserSite,
    UpdateUserSite,
    UserRefresh,
    ScheduledRefresh,
    FlywheelRefresh,
}

impl ActionType {
    /// Whether this action may carry more than one connection per call.
    pub fn allows_batch(self) -> bool {
        matches!(
            self,
            ActionType::ScheduledRefresh | ActionType::FlywheelRefresh
        )
    }
}

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "sitelink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
