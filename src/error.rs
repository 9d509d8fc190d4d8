//! Error handling
//!
//! Two layers. [`LifecycleError`] is the service-layer taxonomy the consent
//! and refresh machinery branches on: protocol errors reject the request with
//! nothing mutated, invariant violations are fatal because they mean caller
//! and store disagree about state. [`ApiError`] is the uniform problem+json
//! response shape, with trace ID propagation for log correlation.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::consent::steps::StepError;
use crate::providers::ProviderError;
use crate::telemetry;

/// Service-layer errors of the connection lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The caller posted something the protocol does not allow here:
    /// a missing or unknown state token, the wrong step kind, an invalid
    /// form. Nothing was mutated.
    #[error("{0}")]
    Protocol(String),

    /// Caller and store disagree about the connection's state. Fatal for
    /// the request; never papered over.
    #[error("{0}")]
    Invariant(String),

    #[error("user site '{0}' not found")]
    NotFound(Uuid),

    /// A provider adapter call failed while we still had to answer the
    /// caller directly (flow initiation, before any session exists).
    #[error(transparent)]
    Gateway(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<StepError> for LifecycleError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::MalformedStoredStep(_) => LifecycleError::Invariant(err.to_string()),
            other => LifecycleError::Protocol(other.to_string()),
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to
    /// a generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    if let Some(code) = db_error.code() {
        let code_str = code.as_ref();
        return code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str);
    }

    false
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

// Error mappers for common sources

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        match error {
            LifecycleError::Protocol(message) => Self::new(
                StatusCode::BAD_REQUEST,
                "PROTOCOL_ERROR".to_string(),
                message,
            ),
            LifecycleError::Invariant(message) => {
                tracing::error!("State invariant violated: {}", message);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Connection state is inconsistent with the request",
                )
            }
            LifecycleError::NotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND".to_string(),
                format!("User site '{id}' not found"),
            ),
            LifecycleError::Gateway(err) => gateway_error(&err),
            LifecycleError::Storage(err) => err.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        // Log the full error for debugging
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Map a provider adapter failure to the uniform 502 shape. Functional
/// provider errors are normally absorbed into connection state before they
/// reach the API layer, so anything arriving here is surfaced verbatim.
pub fn gateway_error(error: &ProviderError) -> ApiError {
    ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR".to_string(),
        error.to_string(),
    )
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a forbidden error (403)
pub fn forbidden(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Insufficient permissions");
    ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_error_carries_code_and_message() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "Bad payload");

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Bad payload"));
        assert_eq!(error.details, None);
    }

    #[test]
    fn protocol_errors_map_to_bad_request() {
        let error: ApiError = LifecycleError::Protocol("no state in redirect".to_string()).into();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Box::from("PROTOCOL_ERROR"));
        assert!(error.message.contains("no state"));
    }

    #[test]
    fn invariant_violations_map_to_internal_error() {
        let error: ApiError =
            LifecycleError::Invariant("step posted for CONNECTED site".to_string()).into();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        // The desync detail stays in the log, not the response
        assert!(!error.message.contains("CONNECTED"));
    }

    #[test]
    fn missing_user_site_maps_to_not_found() {
        let id = Uuid::new_v4();
        let error: ApiError = LifecycleError::NotFound(id).into();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert!(error.message.contains(&id.to_string()));
    }

    #[test]
    fn gateway_failures_map_to_bad_gateway() {
        let error: ApiError =
            LifecycleError::Gateway(ProviderError::Technical("adapter down".to_string())).into();
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.code, Box::from("PROVIDER_ERROR"));
    }

    #[test]
    fn step_errors_split_into_protocol_and_invariant() {
        let protocol: LifecycleError = StepError::MissingAnswer("password".to_string()).into();
        assert!(matches!(protocol, LifecycleError::Protocol(_)));

        let malformed = serde_json::from_str::<crate::consent::steps::FormStep>("{")
            .expect_err("malformed json");
        let invariant: LifecycleError = StepError::MalformedStoredStep(malformed).into();
        assert!(matches!(invariant, LifecycleError::Invariant(_)));
    }

    #[test]
    fn problem_json_content_type_is_set() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "Test error");
        let response = error.into_response();

        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn status_code_is_preserved() {
        let error = ApiError::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn trace_id_falls_back_to_correlation_id() {
        let error = ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Test error",
        );

        let trace_id = error.trace_id.expect("trace id present");
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn record_not_found_maps_to_404() {
        let db_error = sea_orm::DbErr::RecordNotFound("user_sites".to_string());
        let api_error: ApiError = db_error.into();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert!(api_error.message.contains("user_sites"));
    }

    #[test]
    fn validation_error_carries_field_details() {
        let field_errors = json!({"site_id": "required"});
        let error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.details, Some(Box::new(field_errors)));
    }
}
