//! # Login Submission Handler
//!
//! Accepts what the user posted back for the pending step of an open consent
//! session: a completed redirect URL or a filled form. The state token inside
//! the submission selects the session; the response says what happens next.

use axum::{
    extract::{State, rejection::JsonRejection},
    response::Json,
};

use crate::auth::{OperatorAuth, UserContext, UserContextHeaders};
use crate::consent::steps::{Login, StepResult};
use crate::error::ApiError;
use crate::server::AppState;

/// Processes one posted login for the authenticated user
#[utoipa::path(
    post,
    path = "/logins",
    security(("bearer_auth" = [])),
    params(UserContextHeaders),
    request_body = Login,
    responses(
        (status = 200, description = "Submission processed", body = StepResult, example = json!({
            "type": "NEXT_STEP",
            "user_site_id": "550e8400-e29b-41d4-a716-446655440000",
            "step": {
                "type": "FORM",
                "form": { "components": [
                    { "id": "otp", "display_name": "One-time code", "optional": false }
                ]},
                "encryption_details": null,
                "provider_state": null,
                "state_id": "b64-state-token"
            }
        })),
        (status = 400, description = "Protocol error, nothing mutated", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 502, description = "Provider gateway failure", body = ApiError)
    ),
    tag = "flows"
)]
pub async fn process_login(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    context: UserContext,
    login: Result<Json<Login>, JsonRejection>,
) -> Result<Json<StepResult>, ApiError> {
    let Json(login) = login?;

    let result = state
        .login_steps
        .process_login(
            context.user_id,
            context.one_off_user,
            login,
            context.psu_ip,
        )
        .await?;

    Ok(Json(result))
}
