//! # User Site Handlers
//!
//! Listing, refreshing and deleting a user's bank connections. Every handler
//! scopes by the authenticated user; a connection belonging to someone else
//! answers 404 rather than 403.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserContext, UserContextHeaders};
use crate::error::{ApiError, LifecycleError};
use crate::models::ActionType;
use crate::models::user_site::{ConnectionStatus, FailureReason};
use crate::server::AppState;

/// Connection information for API responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSiteInfo {
    /// Unique identifier for the connection
    #[schema(value_type = String)]
    pub id: Uuid,
    /// Bank site this connection points at
    #[schema(value_type = String)]
    pub site_id: Uuid,
    /// Provider serving the site
    pub provider: String,
    /// Connection status
    pub status: ConnectionStatus,
    /// Why the connection is unhealthy, when it is
    pub failure_reason: Option<FailureReason>,
    /// Deadline for an outstanding user step
    pub status_timeout_at: Option<DateTime<Utc>>,
    /// Completion time of the most recent data fetch
    pub last_data_fetch: Option<DateTime<Utc>>,
    /// Whether usable access means are stored for the connection
    #[schema(default = false, example = true)]
    pub has_access_means: bool,
    /// When the connection was created
    pub created_at: DateTime<Utc>,
}

impl From<crate::models::user_site::Model> for UserSiteInfo {
    fn from(model: crate::models::user_site::Model) -> Self {
        Self {
            id: model.id,
            site_id: model.site_id,
            provider: model.provider,
            status: model.status,
            failure_reason: model.failure_reason,
            status_timeout_at: model.status_timeout_at.map(Into::into),
            last_data_fetch: model.last_data_fetch.map(Into::into),
            has_access_means: model.access_means_ciphertext.is_some(),
            created_at: model.created_at.into(),
        }
    }
}

/// Response wrapper for the connection listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSitesResponse {
    /// Live connections of the authenticated user
    pub user_sites: Vec<UserSiteInfo>,
}

/// Outcome of a user-initiated refresh
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    /// Activity tracking the triggered fetch; null when nothing was eligible
    #[schema(value_type = Option<String>)]
    pub activity_id: Option<Uuid>,
}

/// Lists the authenticated user's live connections
#[utoipa::path(
    get,
    path = "/user-sites",
    security(("bearer_auth" = [])),
    params(UserContextHeaders),
    responses(
        (status = 200, description = "Connections of the user", body = UserSitesResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "user-sites"
)]
pub async fn list_user_sites(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    context: UserContext,
) -> Result<Json<UserSitesResponse>, ApiError> {
    let user_sites = state.user_sites.list_for_user(context.user_id).await?;

    Ok(Json(UserSitesResponse {
        user_sites: user_sites.into_iter().map(UserSiteInfo::from).collect(),
    }))
}

/// Triggers a data fetch for one connection
#[utoipa::path(
    post,
    path = "/user-sites/{id}/refresh",
    security(("bearer_auth" = [])),
    params(
        UserContextHeaders,
        ("id" = String, Path, description = "Connection identifier")
    ),
    responses(
        (status = 200, description = "Refresh processed", body = RefreshResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "user-sites"
)]
pub async fn refresh_user_site(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    context: UserContext,
    Path(id): Path<Uuid>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let user_site = state
        .user_sites
        .get(id)
        .await?
        .filter(|us| !us.is_deleted && us.user_id == context.user_id)
        .ok_or(LifecycleError::NotFound(id))?;

    let activity_id = state
        .refresh
        .refresh(
            vec![user_site],
            context.one_off_user,
            ActionType::UserRefresh,
            context.psu_ip,
            None,
        )
        .await?;

    Ok(Json(RefreshResponse { activity_id }))
}

/// Soft-deletes one connection
#[utoipa::path(
    delete,
    path = "/user-sites/{id}",
    security(("bearer_auth" = [])),
    params(
        UserContextHeaders,
        ("id" = String, Path, description = "Connection identifier")
    ),
    responses(
        (status = 204, description = "Connection deleted"),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "user-sites"
)]
pub async fn delete_user_site(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    context: UserContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user_site = state
        .user_sites
        .get(id)
        .await?
        .filter(|us| !us.is_deleted && us.user_id == context.user_id)
        .ok_or(LifecycleError::NotFound(id))?;

    state.user_sites.mark_deleted(user_site.id).await?;
    tracing::info!(user_site_id = %user_site.id, "Connection soft-deleted");

    Ok(StatusCode::NO_CONTENT)
}
