//! UserSite entity model
//!
//! This module contains the SeaORM entity model for the user_sites table. A
//! user_site is one consented connection between an end-user and a bank site;
//! its status, failure reason and soft-delete markers all live on this row.

use super::site::Entity as Site;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// UserSite entity representing one user-to-bank connection.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_sites")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning end-user
    pub user_id: Uuid,

    /// API client the user belongs to; drives retrieval-window policy
    pub client_id: String,

    /// Bank site this connection points at
    pub site_id: Uuid,

    /// Provider key serving the site (denormalized from sites)
    pub provider: String,

    /// Bank-side identity, null until the first successful creation
    pub external_id: Option<Uuid>,

    /// Connection status
    pub status: ConnectionStatus,

    /// Why the connection is not healthy, if it is not
    pub failure_reason: Option<FailureReason>,

    /// Deadline for an outstanding user step; only ever set with STEP_NEEDED
    pub status_timeout_at: Option<DateTimeWithTimeZone>,

    /// Completion time of the most recent data fetch
    pub last_data_fetch: Option<DateTimeWithTimeZone>,

    /// Registered redirect URL used for consent flows
    pub redirect_url_id: Uuid,

    /// Remembered form answers (field id to value) for auto-completion
    #[sea_orm(column_type = "JsonBinary")]
    pub persisted_form_answers: Option<JsonValue>,

    /// Non-null while the connection is being migrated between providers
    pub migration_status: Option<String>,

    /// Encrypted provider access means (direct-connection providers only)
    pub access_means_ciphertext: Option<Vec<u8>>,

    /// When the current access means were issued
    pub access_means_created_at: Option<DateTimeWithTimeZone>,

    /// When the current access means lapse
    pub access_means_expires_at: Option<DateTimeWithTimeZone>,

    /// Soft-delete marker; deletion is monotonic
    pub is_deleted: bool,

    /// When the connection was soft-deleted
    pub deleted_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

/// Connection status. STEP_NEEDED means a login/consent step is waiting on
/// the user and carries a status timeout.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "CONNECTED")]
    #[serde(rename = "CONNECTED")]
    Connected,

    #[sea_orm(string_value = "DISCONNECTED")]
    #[serde(rename = "DISCONNECTED")]
    #[default]
    Disconnected,

    #[sea_orm(string_value = "STEP_NEEDED")]
    #[serde(rename = "STEP_NEEDED")]
    StepNeeded,
}

/// Why a connection is unhealthy. Technical errors are retried by the
/// scheduled passes; the other reasons need the user or the bank to act.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum FailureReason {
    #[sea_orm(string_value = "TECHNICAL_ERROR")]
    #[serde(rename = "TECHNICAL_ERROR")]
    TechnicalError,

    #[sea_orm(string_value = "ACTION_NEEDED_AT_SITE")]
    #[serde(rename = "ACTION_NEEDED_AT_SITE")]
    ActionNeededAtSite,

    #[sea_orm(string_value = "AUTHENTICATION_FAILED")]
    #[serde(rename = "AUTHENTICATION_FAILED")]
    AuthenticationFailed,

    #[sea_orm(string_value = "CONSENT_EXPIRED")]
    #[serde(rename = "CONSENT_EXPIRED")]
    ConsentExpired,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Site",
        from = "Column::SiteId",
        to = "super::site::Column::Id"
    )]
    Site,
}

impl Related<Site> for Entity {
    fn to() -> RelationDef {
        Relation::Site.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
