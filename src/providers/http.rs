//! HTTP client for the provider adapter fleet
//!
//! Every call is a JSON POST under `/providers/{provider}/{call}`, signed
//! with HMAC-SHA256 over the raw body so adapters can authenticate us.
//! Adapters answer errors with a small envelope carrying a machine-readable
//! code; anything else (timeouts, 5xx, unparseable bodies) maps to
//! [`ProviderError::Technical`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProviderGatewayConfig;
use crate::consent::steps::LoginStep;

use super::{
    AccessMeans, AccessMeansOrStep, AccessMeansRequest, ExternalUserRequest, FetchTriggerRequest,
    LoginStepRequest, MfaRequest, ProviderError, ProviderGateway, RenewMeansRequest,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` over the request body.
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Header correlating adapter-side work with our request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Error envelope the adapters answer non-2xx responses with.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

/// Response of the access-means exchange: either the means or one more step.
#[derive(Debug, Deserialize)]
struct AccessMeansEnvelope {
    #[serde(default)]
    access_means: Option<AccessMeans>,
    #[serde(default)]
    next_step: Option<LoginStep>,
}

#[derive(Debug, Deserialize)]
struct ExternalUserEnvelope {
    external_user_id: Uuid,
}

pub struct HttpProviderGateway {
    client: Client,
    base_url: String,
    signing_secret: String,
}

impl HttpProviderGateway {
    pub fn new(config: &ProviderGatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signing_secret: config.signing_secret.clone(),
        })
    }

    fn sign(&self, body: &[u8]) -> Result<String, ProviderError> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|_| ProviderError::Technical("gateway signing key rejected".to_string()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn post<T: Serialize>(
        &self,
        provider: &str,
        call: &'static str,
        request_id: Uuid,
        payload: &T,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            ProviderError::Technical(format!("could not encode {call} request: {err}"))
        })?;
        let signature = self.sign(&body)?;
        let url = format!("{}/providers/{}/{}", self.base_url, provider, call);

        debug!(
            provider = %provider,
            call = %call,
            request_id = %request_id,
            "Calling provider adapter"
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .header(SIGNATURE_HEADER, format!("sha256={signature}"))
            .body(body)
            .send()
            .await?;
        histogram!("provider_gateway_latency_ms").record(start.elapsed().as_secs_f64() * 1_000.0);

        Ok(response)
    }

    /// POST expecting a JSON body back.
    async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        provider: &str,
        call: &'static str,
        request_id: Uuid,
        payload: &T,
    ) -> Result<R, ProviderError> {
        let response = self.post(provider, call, request_id, payload).await?;
        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(|err| {
                ProviderError::Technical(format!("malformed {call} response: {err}"))
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::map_error(provider, call, status, &body))
    }

    /// POST where only the status matters.
    async fn post_ack<T: Serialize>(
        &self,
        provider: &str,
        call: &'static str,
        request_id: Uuid,
        payload: &T,
    ) -> Result<(), ProviderError> {
        let response = self.post(provider, call, request_id, payload).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::map_error(provider, call, status, &body))
    }

    fn map_error(
        provider: &str,
        call: &'static str,
        status: StatusCode,
        body: &str,
    ) -> ProviderError {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            let mapped = match envelope.error.as_str() {
                "AUTHENTICATION_FAILED" => Some(ProviderError::AuthenticationFailed),
                "ACTION_NEEDED_AT_SITE" => Some(ProviderError::ActionNeededAtSite),
                "CONSENT_EXPIRED" => Some(ProviderError::ConsentExpired),
                _ => None,
            };
            if let Some(err) = mapped {
                let metric_labels = vec![("provider", provider.to_string())];
                counter!("provider_gateway_functional_error_total", &metric_labels).increment(1);
                warn!(
                    provider = %provider,
                    call = %call,
                    error = %envelope.error,
                    "Provider adapter returned a functional error"
                );
                return err;
            }
            return ProviderError::Technical(format!(
                "{call} against {provider} failed with {status}: {}",
                envelope.message.unwrap_or(envelope.error)
            ));
        }
        ProviderError::Technical(format!(
            "{call} against {provider} failed with {status}: {body}"
        ))
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn get_login_step(
        &self,
        provider: &str,
        request: LoginStepRequest,
    ) -> Result<LoginStep, ProviderError> {
        self.post_json(provider, "login-step", request.request_id, &request)
            .await
    }

    async fn create_access_means(
        &self,
        provider: &str,
        request: AccessMeansRequest,
    ) -> Result<AccessMeansOrStep, ProviderError> {
        let envelope: AccessMeansEnvelope = self
            .post_json(provider, "access-means", request.request_id, &request)
            .await?;
        match (envelope.access_means, envelope.next_step) {
            (Some(means), _) => Ok(AccessMeansOrStep::Means(means)),
            (None, Some(step)) => Ok(AccessMeansOrStep::Step(step)),
            (None, None) => Err(ProviderError::Technical(format!(
                "access-means response from {provider} carried neither means nor a step"
            ))),
        }
    }

    async fn renew_access_means(
        &self,
        provider: &str,
        request: RenewMeansRequest,
    ) -> Result<AccessMeans, ProviderError> {
        self.post_json(provider, "access-means/renew", request.request_id, &request)
            .await
    }

    async fn submit_mfa(&self, provider: &str, request: MfaRequest) -> Result<(), ProviderError> {
        self.post_ack(provider, "mfa", request.request_id, &request)
            .await
    }

    async fn trigger_fetch(
        &self,
        provider: &str,
        request: FetchTriggerRequest,
    ) -> Result<(), ProviderError> {
        self.post_ack(provider, "fetch", request.request_id(), &request)
            .await
    }

    async fn create_external_user(
        &self,
        provider: &str,
        request: ExternalUserRequest,
    ) -> Result<Uuid, ProviderError> {
        let envelope: ExternalUserEnvelope = self
            .post_json(provider, "external-user", request.request_id, &request)
            .await?;
        Ok(envelope.external_user_id)
    }
}
