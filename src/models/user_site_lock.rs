//! UserSiteLock entity model
//!
//! One row per user_site carrying the TTL lock that serializes mutating
//! operations. Unlocking nulls `activity_id` and `locked_at` in place; the
//! row is never deleted outside the offline purge.

use super::user_site::Entity as UserSite;
use chrono::{DateTime, Duration, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Lock row for one user_site.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "user_site_locks")]
pub struct Model {
    /// Connection this lock belongs to (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_site_id: Uuid,

    /// Activity currently holding the lock, if any
    pub activity_id: Option<Uuid>,

    /// When the holding activity acquired the lock
    pub locked_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the lock row was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the lock row was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// A lock is held while its timestamp is within the TTL. Nulled-out or
    /// expired rows count as free.
    pub fn is_held(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self.locked_at {
            Some(locked_at) => now.signed_duration_since(locked_at.with_timezone(&Utc)) < ttl,
            None => false,
        }
    }
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
