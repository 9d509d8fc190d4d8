//! ConsentSession entity model
//!
//! This module contains the SeaORM entity model for the consent_sessions
//! table. A session correlates the opaque state token handed to the bank with
//! an in-progress login/consent attempt: the pending step, the step counter,
//! opaque provider state and the pre-flow status snapshot used for rollback.

use super::user_site::{ConnectionStatus, Entity as UserSite, FailureReason};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// ConsentSession entity representing one in-progress login/consent attempt.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "consent_sessions")]
pub struct Model {
    /// Unique identifier for the session (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Single-use opaque token round-tripped through the bank; rotated on
    /// every step issue and on every consuming lookup
    pub state_id: String,

    /// End-user driving the flow
    pub user_id: Uuid,

    /// API client the user belongs to
    pub client_id: String,

    /// Whether the flow creates a connection or renews an existing one
    pub operation: Operation,

    /// Site the flow connects to
    pub site_id: Uuid,

    /// Connection under the flow; null until the CREATE path has made one
    pub user_site_id: Option<Uuid>,

    /// Client redirect URL registration the flow was started with
    pub redirect_url_id: Uuid,

    /// Activity correlating all events of this flow
    pub activity_id: Uuid,

    /// Number of steps issued so far; zero means the first post is pending
    pub step_number: i32,

    /// Serialized pending form step, if the pending step is a form
    #[sea_orm(column_type = "JsonBinary")]
    pub form_step: Option<JsonValue>,

    /// Serialized pending redirect step, if the pending step is a redirect
    #[sea_orm(column_type = "JsonBinary")]
    pub redirect_step: Option<JsonValue>,

    /// Opaque provider-side state, round-tripped verbatim
    pub provider_state: Option<String>,

    /// Status snapshot taken before an UPDATE flow touched the connection
    pub original_status: Option<ConnectionStatus>,

    /// Failure-reason snapshot taken alongside `original_status`
    pub original_failure_reason: Option<FailureReason>,

    /// End-user IP forwarded to the provider where regulation requires it
    pub psu_ip_address: Option<String>,

    /// Timestamp when the session was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the session was last updated
    pub updated_at: DateTimeWithTimeZone,
}

/// Which lifecycle operation the flow performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum Operation {
    /// First-time connection of a user to a site.
    #[sea_orm(string_value = "CREATE")]
    #[serde(rename = "CREATE")]
    Create,

    /// Re-consent or credential renewal of an existing connection.
    #[sea_orm(string_value = "UPDATE")]
    #[serde(rename = "UPDATE")]
    Update,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "UserSite",
        from = "Column::UserSiteId",
        to = "super::user_site::Column::Id"
    )]
    UserSite,
}

impl Related<UserSite> for Entity {
    fn to() -> RelationDef {
        Relation::UserSite.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
