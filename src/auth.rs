//! # Authentication and Request Context
//!
//! Operator bearer authentication and user-context header extraction for the
//! protected API surface. The platform in front of this service authenticates
//! end users and forwards their identity in headers; those headers are trusted
//! once the operator token checks out.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;

/// Caller identity forwarded by the platform on every protected request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContext {
    /// Platform user the request acts for
    pub user_id: Uuid,
    /// API client the request originates from; scopes fetch-window policy
    pub client_id: String,
    /// One-off users get their data fetched at most once
    pub one_off_user: bool,
    /// End-user IP address, forwarded to providers that require it
    pub psu_ip: Option<String>,
}

/// Marker type for authenticated operator requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Authentication middleware that validates the operator bearer token and
/// extracts the forwarded user context into request extensions.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    validate_token(&config, token)?;

    let context = extract_user_context(request.headers())?;
    tracing::debug!(
        user_id = %context.user_id,
        client_id = %context.client_id,
        "Authenticated operator request"
    );

    request.extensions_mut().insert(context);
    request.extensions_mut().insert(OperatorAuth);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_user_context(headers: &HeaderMap) -> Result<UserContext, ApiError> {
    let user_id = required_header(headers, "X-User-Id")?
        .parse::<Uuid>()
        .map_err(|_| {
            validation_error(
                "Invalid user ID",
                serde_json::json!({ "X-User-Id": "Must be a valid UUID" }),
            )
        })?;

    // Fetch-window policy keys are lowercase, so client ids are normalized here
    let client_id = required_header(headers, "X-Client-Id")?
        .trim()
        .to_lowercase();
    if client_id.is_empty() {
        return Err(validation_error(
            "Invalid client ID",
            serde_json::json!({ "X-Client-Id": "Must not be empty" }),
        ));
    }

    let one_off_user = optional_header(headers, "X-One-Off-User")?
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false);

    let psu_ip = optional_header(headers, "X-PSU-IP")?
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from);

    Ok(UserContext {
        user_id,
        client_id,
        one_off_user,
        psu_ip,
    })
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    optional_header(headers, name)?.ok_or_else(|| {
        validation_error(
            "Missing required header",
            serde_json::json!({ name: "Required header is missing" }),
        )
    })
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|_| {
                validation_error(
                    "Invalid header",
                    serde_json::json!({ name: "Header must be valid UTF-8" }),
                )
            })
        })
        .transpose()
}

/// OpenAPI header parameters for the forwarded user context
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct UserContextHeaders {
    /// Platform user the request acts for (UUID)
    #[serde(rename = "X-User-Id")]
    #[param(rename = "X-User-Id", value_type = String)]
    pub user_id: String,
    /// API client the request originates from
    #[serde(rename = "X-Client-Id")]
    #[param(rename = "X-Client-Id")]
    pub client_id: String,
    /// Set to `true` for one-off users whose data is fetched at most once
    #[serde(rename = "X-One-Off-User")]
    #[param(rename = "X-One-Off-User", value_type = Option<String>)]
    pub one_off_user: Option<String>,
    /// End-user IP address forwarded to the provider
    #[serde(rename = "X-PSU-IP")]
    #[param(rename = "X-PSU-IP", value_type = Option<String>)]
    pub psu_ip: Option<String>,
}

impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserContext>()
            .cloned()
            .ok_or_else(|| {
                validation_error(
                    "User context missing",
                    serde_json::json!({ "X-User-Id": "User context not present" }),
                )
            })
    }
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorAuth>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Operator authentication required")))
    }
}
