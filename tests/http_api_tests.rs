//! End-to-end API tests over a real listener: operator authentication,
//! context validation and complete flows driven through HTTP.

use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, StatusCode};
use sea_orm::Set;
use serde_json::{Value, json};
use sitelink::clock::ManualClock;
use sitelink::config::AppConfig;
use sitelink::models::site::{self, ProviderKind};
use sitelink::models::user_site::{self, ConnectionStatus};
use sitelink::repositories::NewUserSite;
use sitelink::server::{AppState, create_app};
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{RecordingPublisher, StubGateway, setup_test_db, test_start};

const OPERATOR_TOKEN: &str = "operator-token-tests";

struct TestApi {
    base_url: String,
    client: Client,
    user_id: Uuid,
    state: AppState,
    clock: Arc<ManualClock>,
    gateway: Arc<StubGateway>,
    events: Arc<RecordingPublisher>,
}

async fn spawn_api() -> Result<TestApi> {
    let db = setup_test_db().await?;
    let clock = Arc::new(ManualClock::new(test_start()));
    let gateway = Arc::new(StubGateway::default());
    let events = Arc::new(RecordingPublisher::default());

    let config = AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7u8; 32]),
        ..AppConfig::default()
    };
    let state = AppState::with_parts(
        Arc::new(config),
        db,
        gateway.clone(),
        events.clone(),
        clock.clone(),
    )?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let app = create_app(state.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            eprintln!("test server stopped: {err}");
        }
    });

    Ok(TestApi {
        base_url,
        client: Client::new(),
        user_id: Uuid::new_v4(),
        state,
        clock,
        gateway,
        events,
    })
}

impl TestApi {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("Bearer {OPERATOR_TOKEN}"))
            .header("X-User-Id", self.user_id.to_string())
            .header("X-Client-Id", "acme")
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        Ok(self
            .authed(self.client.post(self.url(path)))
            .json(&body)
            .send()
            .await?)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self.authed(self.client.get(self.url(path))).send().await?)
    }

    async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .authed(self.client.delete(self.url(path)))
            .send()
            .await?)
    }

    async fn seed_site(&self, kind: ProviderKind) -> Result<site::Model> {
        self.state
            .sites
            .create(site::ActiveModel {
                id: Set(Uuid::new_v4()),
                name: Set("Monzo".to_string()),
                provider: Set("monzo-direct".to_string()),
                provider_kind: Set(kind),
                created_at: Set(self.clock.now().into()),
            })
            .await
    }

    async fn seed_connected(&self, site: &site::Model, user_id: Uuid) -> Result<user_site::Model> {
        let us = self
            .state
            .user_sites
            .create(NewUserSite {
                user_id,
                client_id: "acme".to_string(),
                site_id: site.id,
                provider: site.provider.clone(),
                redirect_url_id: Uuid::new_v4(),
            })
            .await?;
        self.state
            .user_sites
            .set_access_means(us.id, "specimen-means", self.clock.now(), None)
            .await?;
        self.state
            .user_sites
            .update_status(us.id, ConnectionStatus::Connected, None, None)
            .await
    }
}

#[tokio::test]
async fn root_health_and_docs_are_public() -> Result<()> {
    let api = spawn_api().await?;

    let root = api.client.get(api.url("/")).send().await?;
    assert_eq!(root.status(), StatusCode::OK);
    let info: Value = root.json().await?;
    assert_eq!(info["service"], "sitelink");

    let health = api.client.get(api.url("/health")).send().await?;
    assert_eq!(health.status(), StatusCode::OK);

    let openapi = api.client.get(api.url("/openapi.json")).send().await?;
    assert_eq!(openapi.status(), StatusCode::OK);
    let doc = openapi.text().await?;
    assert!(doc.contains("/user-sites/{id}/refresh"));
    Ok(())
}

#[tokio::test]
async fn protected_surface_requires_the_operator_token() -> Result<()> {
    let api = spawn_api().await?;

    let anonymous = api.client.get(api.url("/user-sites")).send().await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    let body: Value = anonymous.json().await?;
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert!(body["trace_id"].is_string());

    let wrong_token = api
        .client
        .get(api.url("/user-sites"))
        .header("Authorization", "Bearer wrong-token")
        .header("X-User-Id", api.user_id.to_string())
        .header("X-Client-Id", "acme")
        .send()
        .await?;
    assert_eq!(wrong_token.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn user_context_headers_are_validated() -> Result<()> {
    let api = spawn_api().await?;

    let missing_user = api
        .client
        .get(api.url("/user-sites"))
        .header("Authorization", format!("Bearer {OPERATOR_TOKEN}"))
        .header("X-Client-Id", "acme")
        .send()
        .await?;
    assert_eq!(missing_user.status(), StatusCode::BAD_REQUEST);
    let body: Value = missing_user.json().await?;
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let bad_uuid = api
        .client
        .get(api.url("/user-sites"))
        .header("Authorization", format!("Bearer {OPERATOR_TOKEN}"))
        .header("X-User-Id", "not-a-uuid")
        .header("X-Client-Id", "acme")
        .send()
        .await?;
    assert_eq!(bad_uuid.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn malformed_flow_bodies_are_rejected() -> Result<()> {
    let api = spawn_api().await?;

    let syntax_error = api
        .authed(api.client.post(api.url("/flows")))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(syntax_error.status(), StatusCode::BAD_REQUEST);
    let body: Value = syntax_error.json().await?;
    assert_eq!(body["code"], "VALIDATION_FAILED");

    // Structurally valid JSON that violates the flow protocol.
    let missing_site = api
        .post("/flows", json!({ "operation": "CREATE" }))
        .await?;
    assert_eq!(missing_site.status(), StatusCode::BAD_REQUEST);
    let body: Value = missing_site.json().await?;
    assert_eq!(body["code"], "PROTOCOL_ERROR");
    Ok(())
}

#[tokio::test]
async fn create_flow_completes_over_http() -> Result<()> {
    let api = spawn_api().await?;
    let site = api.seed_site(ProviderKind::DirectConnection).await?;

    let opened = api
        .post(
            "/flows",
            json!({
                "operation": "CREATE",
                "siteId": site.id,
                "redirectUrlId": Uuid::new_v4(),
            }),
        )
        .await?;
    assert_eq!(opened.status(), StatusCode::CREATED);
    let flow: Value = opened.json().await?;
    assert!(flow["sessionId"].is_string());
    assert!(flow["userSiteId"].is_null());
    assert_eq!(flow["step"]["type"], "REDIRECT");
    let state_token = flow["step"]["state_id"]
        .as_str()
        .expect("step carries its state token")
        .to_string();

    let submitted = api
        .post(
            "/logins",
            json!({
                "type": "URL",
                "redirect_url": format!("https://client.example/cb?state={state_token}&code=grant"),
            }),
        )
        .await?;
    assert_eq!(submitted.status(), StatusCode::OK);
    let result: Value = submitted.json().await?;
    assert_eq!(result["type"], "ACTIVITY");
    assert!(result["user_site_id"].is_string());
    assert!(result["activity_id"].is_string());

    let listed = api.get("/user-sites").await?;
    assert_eq!(listed.status(), StatusCode::OK);
    let listing: Value = listed.json().await?;
    let sites = listing["userSites"].as_array().expect("array of connections");
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0]["status"], "CONNECTED");
    assert_eq!(sites[0]["hasAccessMeans"], true);

    assert_eq!(api.gateway.fetch_request_count(), 1);
    assert_eq!(api.events.count("connection_created"), 1);
    assert_eq!(api.events.count("refresh_started"), 1);
    Ok(())
}

#[tokio::test]
async fn refresh_endpoint_reports_its_activity_and_respects_the_lock() -> Result<()> {
    let api = spawn_api().await?;
    let site = api.seed_site(ProviderKind::DirectConnection).await?;
    let us = api.seed_connected(&site, api.user_id).await?;

    let refreshed = api
        .post(&format!("/user-sites/{}/refresh", us.id), json!({}))
        .await?;
    assert_eq!(refreshed.status(), StatusCode::OK);
    let body: Value = refreshed.json().await?;
    assert!(body["activityId"].is_string());

    // The connection is still locked by the first activity.
    let busy = api
        .post(&format!("/user-sites/{}/refresh", us.id), json!({}))
        .await?;
    assert_eq!(busy.status(), StatusCode::OK);
    let body: Value = busy.json().await?;
    assert!(body["activityId"].is_null());

    assert_eq!(api.gateway.fetch_request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn foreign_and_unknown_connections_answer_not_found() -> Result<()> {
    let api = spawn_api().await?;
    let site = api.seed_site(ProviderKind::DirectConnection).await?;
    let foreign = api.seed_connected(&site, Uuid::new_v4()).await?;

    let refresh = api
        .post(&format!("/user-sites/{}/refresh", foreign.id), json!({}))
        .await?;
    assert_eq!(refresh.status(), StatusCode::NOT_FOUND);
    let body: Value = refresh.json().await?;
    assert_eq!(body["code"], "NOT_FOUND");

    let unknown = api
        .post(&format!("/user-sites/{}/refresh", Uuid::new_v4()), json!({}))
        .await?;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let update_flow = api
        .post(
            "/flows",
            json!({ "operation": "UPDATE", "userSiteId": foreign.id }),
        )
        .await?;
    assert_eq!(update_flow.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn delete_hides_the_connection_from_the_listing() -> Result<()> {
    let api = spawn_api().await?;
    let site = api.seed_site(ProviderKind::DirectConnection).await?;
    let us = api.seed_connected(&site, api.user_id).await?;

    let deleted = api.delete(&format!("/user-sites/{}", us.id)).await?;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let listing: Value = api.get("/user-sites").await?.json().await?;
    assert!(listing["userSites"].as_array().expect("array").is_empty());

    // The row is gone from the API surface, not from storage.
    let stored = api.state.user_sites.require(us.id).await?;
    assert!(stored.is_deleted);

    let again = api.delete(&format!("/user-sites/{}", us.id)).await?;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn form_follow_up_round_trips_over_http() -> Result<()> {
    let api = spawn_api().await?;
    let site = api.seed_site(ProviderKind::DirectConnection).await?;

    let opened = api
        .post(
            "/flows",
            json!({
                "operation": "CREATE",
                "siteId": site.id,
                "redirectUrlId": Uuid::new_v4(),
            }),
        )
        .await?;
    let flow: Value = opened.json().await?;
    let state_token = flow["step"]["state_id"].as_str().expect("state").to_string();

    // The exchange asks for one more form before handing over the means.
    api.gateway
        .queue_access_means(Ok(sitelink::providers::AccessMeansOrStep::Step(
            test_utils::form_step("state-otp", &[("otp", false)]),
        )));

    let parked: Value = api
        .post(
            "/logins",
            json!({
                "type": "URL",
                "redirect_url": format!("https://client.example/cb?state={state_token}&code=grant"),
            }),
        )
        .await?
        .json()
        .await?;
    assert_eq!(parked["type"], "NEXT_STEP");
    assert_eq!(parked["step"]["type"], "FORM");
    let user_site_id = parked["user_site_id"].as_str().expect("connection id");

    let finished: Value = api
        .post(
            "/logins",
            json!({
                "type": "FORM",
                "state_id": "state-otp",
                "filled_form": { "otp": "4242" },
            }),
        )
        .await?
        .json()
        .await?;
    assert_eq!(finished["type"], "ACTIVITY");
    assert_eq!(finished["user_site_id"], user_site_id);
    Ok(())
}
