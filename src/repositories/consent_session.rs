//! ConsentSession repository for database operations
//!
//! Sessions are short-lived rows keyed by a single-use state token. Lookups
//! are destructive reads: the token is rotated in the same breath, so a
//! replayed or raced submission finds nothing.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::consent::steps::{self, LoginStep};
use crate::models::consent_session::{self, Entity as ConsentSession, Operation};
use crate::models::user_site::{ConnectionStatus, FailureReason};

/// Fields for a new consent session.
#[derive(Debug, Clone)]
pub struct NewConsentSession {
    pub user_id: Uuid,
    pub client_id: String,
    pub operation: Operation,
    pub site_id: Uuid,
    pub user_site_id: Option<Uuid>,
    pub redirect_url_id: Uuid,
    pub activity_id: Uuid,
    /// Step issued at flow initiation; absent when the first inbound post is
    /// a redirect the caller obtained out of band
    pub pending_step: Option<LoginStep>,
    pub provider_state: Option<String>,
    /// Pre-flow (status, reason) snapshot for UPDATE rollback
    pub original_status: Option<(ConnectionStatus, Option<FailureReason>)>,
    pub psu_ip_address: Option<String>,
}

/// Repository for consent_session database operations
#[derive(Clone)]
pub struct ConsentSessionRepository {
    db: Arc<DatabaseConnection>,
    clock: SharedClock,
}

impl ConsentSessionRepository {
    /// Creates a new ConsentSessionRepository instance
    pub fn new(db: Arc<DatabaseConnection>, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Creates a session. Its state token is the pending step's token when a
    /// step was issued, otherwise a fresh one.
    pub async fn create(&self, new: NewConsentSession) -> Result<consent_session::Model> {
        let now = self.clock.now();
        let id = Uuid::new_v4();

        let state_id = match &new.pending_step {
            Some(step) => step.state_id().to_string(),
            None => steps::generate_state_id(),
        };
        let (form_step, redirect_step) = match &new.pending_step {
            Some(step) => steps::step_columns(step)
                .map_err(|e| anyhow!("pending step serialization failed: {}", e))?,
            None => (None, None),
        };
        let (original_status, original_failure_reason) = match new.original_status {
            Some((status, reason)) => (Some(status), reason),
            None => (None, None),
        };

        let active = consent_session::ActiveModel {
            id: Set(id),
            state_id: Set(state_id),
            user_id: Set(new.user_id),
            client_id: Set(new.client_id),
            operation: Set(new.operation),
            site_id: Set(new.site_id),
            user_site_id: Set(new.user_site_id),
            redirect_url_id: Set(new.redirect_url_id),
            activity_id: Set(new.activity_id),
            step_number: Set(0),
            form_step: Set(form_step),
            redirect_step: Set(redirect_step),
            provider_state: Set(new.provider_state),
            original_status: Set(original_status),
            original_failure_reason: Set(original_failure_reason),
            psu_ip_address: Set(new.psu_ip_address),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        active.insert(&*self.db).await?;

        let fetched = ConsentSession::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("consent session not persisted"))
    }

    /// Finds a session by state token and rotates the token in place. The
    /// rotation is a compare-and-set on the old token, so of two racing
    /// submissions exactly one gets the session; the other sees `None`.
    pub async fn find_by_state_and_rotate(
        &self,
        state_id: &str,
    ) -> Result<Option<consent_session::Model>> {
        let Some(session) = ConsentSession::find()
            .filter(consent_session::Column::StateId.eq(state_id))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        let rotated = steps::generate_state_id();
        let now = self.clock.now();

        let result = ConsentSession::update_many()
            .col_expr(
                consent_session::Column::StateId,
                Expr::value(rotated.clone()),
            )
            .col_expr(
                consent_session::Column::UpdatedAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(now)),
            )
            .filter(consent_session::Column::Id.eq(session.id))
            .filter(consent_session::Column::StateId.eq(state_id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            // Lost the race to another submission carrying the same token
            return Ok(None);
        }

        Ok(Some(consent_session::Model {
            state_id: rotated,
            updated_at: now.into(),
            ..session
        }))
    }

    /// Replaces the pending step: stores the new step under its own state
    /// token and bumps the step counter.
    pub async fn replace_pending_step(
        &self,
        session_id: Uuid,
        step: &LoginStep,
    ) -> Result<consent_session::Model> {
        let existing = ConsentSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| anyhow!("consent session '{}' not found", session_id))?;

        let (form_step, redirect_step) = steps::step_columns(step)
            .map_err(|e| anyhow!("pending step serialization failed: {}", e))?;

        let step_number = existing.step_number + 1;
        let mut model: consent_session::ActiveModel = existing.into();
        model.state_id = Set(step.state_id().to_string());
        model.step_number = Set(step_number);
        model.form_step = Set(form_step);
        model.redirect_step = Set(redirect_step);
        model.provider_state = Set(step.provider_state().map(str::to_string));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Attaches the connection created mid-flow to its session
    pub async fn set_user_site(
        &self,
        session_id: Uuid,
        user_site_id: Uuid,
    ) -> Result<consent_session::Model> {
        let existing = ConsentSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| anyhow!("consent session '{}' not found", session_id))?;

        let mut model: consent_session::ActiveModel = existing.into();
        model.user_site_id = Set(Some(user_site_id));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Finds a session by its ID
    pub async fn get(&self, id: Uuid) -> Result<Option<consent_session::Model>> {
        Ok(ConsentSession::find_by_id(id).one(&*self.db).await?)
    }

    /// Deletes a session once its flow terminated
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = ConsentSession::delete_by_id(id).exec(&*self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Discards every session attached to a connection
    pub async fn delete_for_user_site(&self, user_site_id: Uuid) -> Result<u64> {
        let result = ConsentSession::delete_many()
            .filter(consent_session::Column::UserSiteId.eq(user_site_id))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Lists sessions created before the cutoff, oldest first, for the
    /// cleanup sweeper
    pub async fn find_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<consent_session::Model>> {
        let cutoff: sea_orm::prelude::DateTimeWithTimeZone = cutoff.into();
        Ok(ConsentSession::find()
            .filter(consent_session::Column::CreatedAt.lte(cutoff))
            .order_by_asc(consent_session::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }
}
