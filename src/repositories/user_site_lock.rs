//! UserSiteLock repository for database operations
//!
//! `attempt_lock` is the concurrency primitive of the whole service: one
//! conditional upsert whose affected-row count decides whether the caller won
//! the lock. Everything else in here is bookkeeping around that row.

use anyhow::Result;
use chrono::Duration;
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, Set,
    prelude::DateTimeWithTimeZone,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::models::user_site_lock::{self, Entity as UserSiteLock};

/// Repository for user_site_lock database operations
#[derive(Clone)]
pub struct UserSiteLockRepository {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
    ttl: Duration,
}

impl UserSiteLockRepository {
    /// Creates a new UserSiteLockRepository instance
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock, ttl: Duration) -> Self {
        Self { db, clock, ttl }
    }

    /// How long a lock is honored before it counts as abandoned.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Attempts to take the lock for an activity. Returns `true` when this
    /// call acquired it, `false` when another activity holds it within the
    /// TTL. Never blocks, never retries.
    ///
    /// The whole check-and-take is a single conditional upsert so two racing
    /// callers resolve in the database: insert the row, or overwrite it only
    /// if `locked_at` is null or older than the TTL. An overwrite suppressed
    /// by that condition reports zero affected rows.
    pub async fn attempt_lock(&self, user_site_id: Uuid, activity_id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        let cutoff: DateTimeWithTimeZone = (now - self.ttl).into();

        let active = user_site_lock::ActiveModel {
            user_site_id: Set(user_site_id),
            activity_id: Set(Some(activity_id)),
            locked_at: Set(Some(now.into())),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let on_conflict = OnConflict::column(user_site_lock::Column::UserSiteId)
            .update_columns([
                user_site_lock::Column::ActivityId,
                user_site_lock::Column::LockedAt,
                user_site_lock::Column::UpdatedAt,
            ])
            .action_and_where(
                Condition::any()
                    .add(user_site_lock::Column::LockedAt.is_null())
                    .add(user_site_lock::Column::LockedAt.lte(cutoff))
                    .into(),
            )
            .to_owned();

        let rows_affected = UserSiteLock::insert(active)
            .on_conflict(on_conflict)
            .exec_without_returning(&*self.db)
            .await?;

        let acquired = rows_affected > 0;
        if !acquired {
            counter!("user_site_lock_contended_total").increment(1);
            tracing::debug!(
                user_site_id = %user_site_id,
                activity_id = %activity_id,
                "Lock attempt lost to a holder within TTL"
            );
        }
        Ok(acquired)
    }

    /// Releases the lock by nulling its fields in place. Returns whether a
    /// held row was actually cleared; unlocking a free lock is a no-op.
    pub async fn unlock(&self, user_site_id: Uuid) -> Result<bool> {
        let now: DateTimeWithTimeZone = self.clock.now().into();

        let result = UserSiteLock::update_many()
            .col_expr(
                user_site_lock::Column::ActivityId,
                Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                user_site_lock::Column::LockedAt,
                Expr::value(Option::<DateTimeWithTimeZone>::None),
            )
            .col_expr(user_site_lock::Column::UpdatedAt, Expr::value(now))
            .filter(user_site_lock::Column::UserSiteId.eq(user_site_id))
            .filter(user_site_lock::Column::LockedAt.is_not_null())
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Reads the lock row without taking it
    pub async fn peek(&self, user_site_id: Uuid) -> Result<Option<user_site_lock::Model>> {
        Ok(UserSiteLock::find_by_id(user_site_id).one(&*self.db).await?)
    }

    /// Whether the lock is currently held, and by which activity
    pub async fn holder(&self, user_site_id: Uuid) -> Result<Option<Uuid>> {
        let now = self.clock.now();
        Ok(self
            .peek(user_site_id)
            .await?
            .filter(|lock| lock.is_held(now, self.ttl))
            .and_then(|lock| lock.activity_id))
    }

    /// Permanently removes a lock row. Only the purge path calls this.
    pub async fn hard_delete(&self, user_site_id: Uuid) -> Result<bool> {
        let result = UserSiteLock::delete_by_id(user_site_id)
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
