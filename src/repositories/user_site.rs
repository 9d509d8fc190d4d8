//! UserSite repository for database operations
//!
//! This module provides the UserSiteRepository struct which encapsulates
//! SeaORM operations for the user_sites table. Status transitions go through
//! a single operation so the STEP_NEEDED/timeout coupling and the soft-delete
//! monotonicity cannot be violated by ad-hoc writes.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::consent::steps::FilledForm;
use crate::crypto::{CryptoKey, decrypt_access_means, encrypt_access_means};
use crate::models::user_site::{self, ConnectionStatus, Entity as UserSite, FailureReason};

/// Fields for a new connection row. The row starts DISCONNECTED with no
/// external identity; both arrive later in the flow.
#[derive(Debug, Clone)]
pub struct NewUserSite {
    pub user_id: Uuid,
    pub client_id: String,
    pub site_id: Uuid,
    pub provider: String,
    pub redirect_url_id: Uuid,
}

/// Repository for user_site database operations
#[derive(Clone)]
pub struct UserSiteRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for access-means encryption
    pub crypto_key: CryptoKey,
    clock: SharedClock,
}

impl UserSiteRepository {
    /// Creates a new UserSiteRepository instance
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey, clock: SharedClock) -> Self {
        Self {
            db,
            crypto_key,
            clock,
        }
    }

    /// Creates a new connection row
    pub async fn create(&self, new: NewUserSite) -> Result<user_site::Model> {
        let now = self.clock.now();
        let id = Uuid::new_v4();

        let active = user_site::ActiveModel {
            id: Set(id),
            user_id: Set(new.user_id),
            client_id: Set(new.client_id),
            site_id: Set(new.site_id),
            provider: Set(new.provider),
            external_id: Set(None),
            status: Set(ConnectionStatus::Disconnected),
            failure_reason: Set(None),
            status_timeout_at: Set(None),
            last_data_fetch: Set(None),
            redirect_url_id: Set(new.redirect_url_id),
            persisted_form_answers: Set(None),
            migration_status: Set(None),
            access_means_ciphertext: Set(None),
            access_means_created_at: Set(None),
            access_means_expires_at: Set(None),
            is_deleted: Set(false),
            deleted_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        active.insert(&*self.db).await?;

        let fetched = UserSite::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("user site not persisted"))
    }

    /// Finds a connection by its ID
    pub async fn get(&self, id: Uuid) -> Result<Option<user_site::Model>> {
        Ok(UserSite::find_by_id(id).one(&*self.db).await?)
    }

    /// Finds a connection by its ID, erroring when it does not exist
    pub async fn require(&self, id: Uuid) -> Result<user_site::Model> {
        self.get(id)
            .await?
            .ok_or_else(|| anyhow!("user site '{}' not found", id))
    }

    /// Lists live connections for a user ordered by creation time then ID
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<user_site::Model>> {
        Ok(UserSite::find()
            .filter(user_site::Column::UserId.eq(user_id))
            .filter(user_site::Column::IsDeleted.eq(false))
            .order_by_asc(user_site::Column::CreatedAt)
            .order_by_asc(user_site::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// The single status-transition operation. A status timeout is only
    /// storable with STEP_NEEDED and is cleared on every other transition;
    /// soft-deleted rows reject transitions outright.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: ConnectionStatus,
        failure_reason: Option<FailureReason>,
        status_timeout_at: Option<DateTime<Utc>>,
    ) -> Result<user_site::Model> {
        if status_timeout_at.is_some() && status != ConnectionStatus::StepNeeded {
            return Err(anyhow!(
                "status timeout may only be set together with STEP_NEEDED"
            ));
        }
        if status == ConnectionStatus::StepNeeded && status_timeout_at.is_none() {
            return Err(anyhow!("STEP_NEEDED requires a status timeout"));
        }

        let existing = self.require(id).await?;
        if existing.is_deleted {
            return Err(anyhow!(
                "user site '{}' is deleted; status transitions are rejected",
                id
            ));
        }

        let mut model: user_site::ActiveModel = existing.into();
        model.status = Set(status);
        model.failure_reason = Set(failure_reason);
        model.status_timeout_at = Set(status_timeout_at.map(Into::into));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Records the bank-side identity created for this connection
    pub async fn set_external_id(&self, id: Uuid, external_id: Uuid) -> Result<user_site::Model> {
        let existing = self.require(id).await?;

        let mut model: user_site::ActiveModel = existing.into();
        model.external_id = Set(Some(external_id));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Encrypts and stores a fresh access-means blob with its validity window
    pub async fn set_access_means(
        &self,
        id: Uuid,
        means: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<user_site::Model> {
        let existing = self.require(id).await?;

        let ciphertext = encrypt_access_means(&self.crypto_key, &existing, means)
            .map_err(|e| anyhow!("access means encryption failed: {}", e))?;

        let mut model: user_site::ActiveModel = existing.into();
        model.access_means_ciphertext = Set(Some(ciphertext));
        model.access_means_created_at = Set(Some(created_at.into()));
        model.access_means_expires_at = Set(expires_at.map(Into::into));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Decrypts the access-means blob stored on a connection, if any
    pub fn decrypt_access_means(&self, user_site: &user_site::Model) -> Result<Option<String>> {
        decrypt_access_means(&self.crypto_key, user_site).map_err(|e| {
            tracing::error!(
                user_site_id = %user_site.id,
                provider = %user_site.provider,
                "Access means decryption failed"
            );
            anyhow!("access means decryption failed: {}", e)
        })
    }

    /// Records the completion time of a successful data fetch
    pub async fn set_last_data_fetch(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<user_site::Model> {
        let existing = self.require(id).await?;

        let mut model: user_site::ActiveModel = existing.into();
        model.last_data_fetch = Set(Some(at.into()));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Merges submitted form answers into the remembered set. Existing keys
    /// are overwritten; answers for other fields are kept.
    pub async fn merge_persisted_answers(
        &self,
        id: Uuid,
        answers: &FilledForm,
    ) -> Result<user_site::Model> {
        let existing = self.require(id).await?;

        let mut merged: FilledForm = existing
            .persisted_form_answers
            .as_ref()
            .and_then(|json| serde_json::from_value(json.clone()).ok())
            .unwrap_or_default();
        for (key, value) in answers {
            merged.insert(key.clone(), value.clone());
        }

        let mut model: user_site::ActiveModel = existing.into();
        model.persisted_form_answers = Set(Some(serde_json::to_value(&merged)?));
        model.updated_at = Set(self.clock.now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Soft-deletes a connection. Deletion is monotonic; repeated calls keep
    /// the original deletion timestamp.
    pub async fn mark_deleted(&self, id: Uuid) -> Result<user_site::Model> {
        let existing = self.require(id).await?;
        if existing.is_deleted {
            return Ok(existing);
        }

        let now = self.clock.now();
        let mut model: user_site::ActiveModel = existing.into();
        model.is_deleted = Set(true);
        model.deleted_at = Set(Some(now.into()));
        model.updated_at = Set(now.into());

        Ok(model.update(&*self.db).await?)
    }

    /// Lists connections due for a background refresh pass: live, not
    /// mid-migration, not waiting on a user step, healthy or merely
    /// technically failed, and last fetched before the cutoff (or never).
    pub async fn find_refresh_candidates(
        &self,
        due_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<user_site::Model>> {
        Ok(UserSite::find()
            .filter(user_site::Column::IsDeleted.eq(false))
            .filter(user_site::Column::MigrationStatus.is_null())
            .filter(user_site::Column::Status.ne(ConnectionStatus::StepNeeded))
            .filter(
                Condition::any()
                    .add(user_site::Column::FailureReason.is_null())
                    .add(user_site::Column::FailureReason.eq(FailureReason::TechnicalError)),
            )
            .filter(
                Condition::any()
                    .add(user_site::Column::LastDataFetch.is_null())
                    .add(user_site::Column::LastDataFetch.lt(due_before)),
            )
            .order_by_asc(user_site::Column::LastDataFetch)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Lists soft-deleted connections older than the cutoff, for the offline
    /// purge.
    pub async fn find_purgeable(
        &self,
        deleted_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<user_site::Model>> {
        let deleted_before: DateTimeWithTimeZone = deleted_before.into();
        Ok(UserSite::find()
            .filter(user_site::Column::IsDeleted.eq(true))
            .filter(user_site::Column::DeletedAt.lte(deleted_before))
            .order_by_asc(user_site::Column::DeletedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Permanently removes a connection row. Only the purge path calls this,
    /// and only for rows that are already soft-deleted.
    pub async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let result = UserSite::delete_by_id(id)
            .filter(user_site::Column::IsDeleted.eq(true))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
