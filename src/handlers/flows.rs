//! # Consent Flow Handlers
//!
//! Opens login and consent flows. The response carries the first step the
//! caller puts in front of the user; everything after that goes through the
//! login endpoint.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserContext, UserContextHeaders};
use crate::consent::processor::{StartFlowRequest, StartedFlow};
use crate::consent::steps::LoginStep;
use crate::error::ApiError;
use crate::models::consent_session::Operation;
use crate::server::AppState;

/// Request body for opening a consent flow
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartFlowBody {
    /// CREATE connects a new bank, UPDATE renews an existing connection
    pub operation: Operation,
    /// Site to connect; required for CREATE
    #[schema(value_type = Option<String>)]
    pub site_id: Option<Uuid>,
    /// Connection to renew; required for UPDATE
    #[schema(value_type = Option<String>)]
    pub user_site_id: Option<Uuid>,
    /// Registered redirect URL to route the user back through; required for
    /// CREATE, ignored for UPDATE
    #[schema(value_type = Option<String>)]
    pub redirect_url_id: Option<Uuid>,
}

/// An opened flow with the first step to present
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartFlowResponse {
    /// Consent session tracking this flow
    #[schema(value_type = String)]
    pub session_id: Uuid,
    /// Connection being renewed; absent for CREATE until the first
    /// submission comes back
    #[schema(value_type = Option<String>)]
    pub user_site_id: Option<Uuid>,
    /// First step to put in front of the user
    pub step: LoginStep,
}

impl From<StartedFlow> for StartFlowResponse {
    fn from(started: StartedFlow) -> Self {
        Self {
            session_id: started.session_id,
            user_site_id: started.user_site_id,
            step: started.step,
        }
    }
}

/// Opens a consent flow for the authenticated user
#[utoipa::path(
    post,
    path = "/flows",
    security(("bearer_auth" = [])),
    params(UserContextHeaders),
    request_body = StartFlowBody,
    responses(
        (status = 201, description = "Flow opened", body = StartFlowResponse),
        (status = 400, description = "Validation or protocol error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 502, description = "Provider gateway failure", body = ApiError)
    ),
    tag = "flows"
)]
pub async fn start_flow(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    context: UserContext,
    body: Result<Json<StartFlowBody>, JsonRejection>,
) -> Result<(StatusCode, Json<StartFlowResponse>), ApiError> {
    let Json(body) = body?;

    let started = state
        .login_steps
        .start_flow(StartFlowRequest {
            user_id: context.user_id,
            client_id: context.client_id,
            operation: body.operation,
            site_id: body.site_id,
            user_site_id: body.user_site_id,
            redirect_url_id: body.redirect_url_id,
            psu_ip_address: context.psu_ip,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(started.into())))
}
