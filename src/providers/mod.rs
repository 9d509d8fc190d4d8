//! Provider gateway boundary
//!
//! Everything bank-specific lives on the other side of this trait: the
//! downstream provider adapters speak a normalized JSON API, and this module
//! defines the calls, the request shapes and the error taxonomy the lifecycle
//! machinery branches on. The production implementation is the HTTP client in
//! [`http`]; tests substitute their own.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::consent::steps::{FilledForm, LoginStep};
use crate::models::user_site::{ConnectionStatus, FailureReason};

/// Errors coming back from a provider adapter.
///
/// The first three are functional: the user or the bank must act, retrying
/// does not help. `Technical` covers network failures, timeouts and 5xx
/// responses; those connections stay eligible for the next scheduled pass.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected the user's authentication")]
    AuthenticationFailed,

    #[error("the user must act at the bank site first")]
    ActionNeededAtSite,

    #[error("the consent backing this connection has expired")]
    ConsentExpired,

    #[error("provider call failed: {0}")]
    Technical(String),
}

impl ProviderError {
    /// Functional errors surface to the user; technical ones are retried by
    /// the scheduled passes.
    pub fn is_functional(&self) -> bool {
        !matches!(self, ProviderError::Technical(_))
    }

    /// The failure reason a connection carries after this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ProviderError::AuthenticationFailed => FailureReason::AuthenticationFailed,
            ProviderError::ActionNeededAtSite => FailureReason::ActionNeededAtSite,
            ProviderError::ConsentExpired => FailureReason::ConsentExpired,
            ProviderError::Technical(_) => FailureReason::TechnicalError,
        }
    }

    /// The status a connection lands in after this error during a refresh.
    /// Technical errors keep the connection CONNECTED so it is retried;
    /// consent expiry only disconnects when policy says so.
    pub fn refresh_status(&self, disconnect_on_consent_expired: bool) -> ConnectionStatus {
        match self {
            ProviderError::Technical(_) => ConnectionStatus::Connected,
            ProviderError::ConsentExpired if !disconnect_on_consent_expired => {
                ConnectionStatus::Connected
            }
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Technical(err.to_string())
    }
}

/// Request for the first login step of a consent flow.
#[derive(Debug, Clone, Serialize)]
pub struct LoginStepRequest {
    /// Correlates the async provider-side work with this call
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub site_id: Uuid,
    pub redirect_url_id: Uuid,
    /// State token the bank must round-trip back
    pub state_id: String,
    pub psu_ip_address: Option<String>,
}

/// Request to exchange a completed login for access means.
#[derive(Debug, Clone, Serialize)]
pub struct AccessMeansRequest {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub user_site_id: Uuid,
    /// Completed redirect-back URL, for URL logins
    pub redirect_url: Option<String>,
    /// Submitted answers, for form logins
    pub filled_form: Option<FilledForm>,
    /// Opaque provider state round-tripped from the step being answered
    pub provider_state: Option<String>,
    pub state_id: String,
    pub psu_ip_address: Option<String>,
}

/// Opaque credential blob with its validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessMeans {
    pub blob: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The exchange either finishes or asks the user for one more step.
#[derive(Debug, Clone)]
pub enum AccessMeansOrStep {
    Means(AccessMeans),
    Step(LoginStep),
}

/// Request to renew access means that are about to lapse.
#[derive(Debug, Clone, Serialize)]
pub struct RenewMeansRequest {
    pub request_id: Uuid,
    pub user_site_id: Uuid,
    /// Current access-means blob, decrypted
    pub access_means: String,
    pub psu_ip_address: Option<String>,
}

/// MFA answer fed into an in-flight scraping operation.
#[derive(Debug, Clone, Serialize)]
pub struct MfaRequest {
    pub request_id: Uuid,
    pub external_user_id: Uuid,
    pub activity_id: Uuid,
    pub filled_form: FilledForm,
    pub provider_state: Option<String>,
}

/// Fetch trigger. Direct API providers get the access means and window;
/// scraping providers are addressed by their external user.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchTriggerRequest {
    DirectApi {
        request_id: Uuid,
        user_site_id: Uuid,
        activity_id: Uuid,
        /// Current access-means blob, decrypted
        access_means: String,
        /// Lower bound of the retrieval window
        fetch_from: DateTime<Utc>,
        psu_ip_address: Option<String>,
    },
    Scraping {
        request_id: Uuid,
        user_site_id: Uuid,
        activity_id: Uuid,
        external_user_id: Uuid,
        /// Lower bound of the retrieval window
        fetch_from: DateTime<Utc>,
    },
}

impl FetchTriggerRequest {
    pub fn request_id(&self) -> Uuid {
        match self {
            FetchTriggerRequest::DirectApi { request_id, .. } => *request_id,
            FetchTriggerRequest::Scraping { request_id, .. } => *request_id,
        }
    }
}

/// Request to create (or re-credential) the bank-side user of a scraping
/// provider. The provider starts its create-and-fetch in the same operation.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalUserRequest {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub user_site_id: Uuid,
    pub site_id: Uuid,
    pub activity_id: Uuid,
    /// Existing bank-side identity when re-credentialing
    pub external_user_id: Option<Uuid>,
    /// Login credentials the user submitted
    pub filled_form: FilledForm,
}

/// The calls the lifecycle machinery makes against provider adapters.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// First step of a consent flow for a site served by this provider.
    async fn get_login_step(
        &self,
        provider: &str,
        request: LoginStepRequest,
    ) -> Result<LoginStep, ProviderError>;

    /// Exchange a completed login for access means, or receive another step.
    async fn create_access_means(
        &self,
        provider: &str,
        request: AccessMeansRequest,
    ) -> Result<AccessMeansOrStep, ProviderError>;

    /// Renew access means before they lapse.
    async fn renew_access_means(
        &self,
        provider: &str,
        request: RenewMeansRequest,
    ) -> Result<AccessMeans, ProviderError>;

    /// Feed an MFA answer into an in-flight scraping operation.
    async fn submit_mfa(&self, provider: &str, request: MfaRequest) -> Result<(), ProviderError>;

    /// Trigger a data fetch for a connected user-site.
    async fn trigger_fetch(
        &self,
        provider: &str,
        request: FetchTriggerRequest,
    ) -> Result<(), ProviderError>;

    /// Create the bank-side user for a scraping provider; returns its id.
    async fn create_external_user(
        &self,
        provider: &str,
        request: ExternalUserRequest,
    ) -> Result<Uuid, ProviderError>;
}
