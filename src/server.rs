//! # Server Configuration
//!
//! Router assembly, shared application state and the server entry point. The
//! background loops (session cleanup and the refresh flywheel) start next to
//! the listener and stop on the same shutdown token.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::Request,
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
};
use chrono::Duration;
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::auth::auth_middleware;
use crate::clock::{self, SharedClock};
use crate::config::AppConfig;
use crate::consent::{LoginStepService, SessionCleanupService};
use crate::crypto::CryptoKey;
use crate::db;
use crate::events::{LogEventPublisher, SharedEventPublisher};
use crate::handlers;
use crate::providers::ProviderGateway;
use crate::providers::http::HttpProviderGateway;
use crate::refresh::{FlywheelService, RefreshService};
use crate::repositories::{
    ConsentSessionRepository, SiteRepository, UserSiteLockRepository, UserSiteRepository,
};
use crate::seeds;
use crate::telemetry::{self, TraceContext};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub sites: SiteRepository,
    pub user_sites: UserSiteRepository,
    pub locks: UserSiteLockRepository,
    pub sessions: ConsentSessionRepository,
    pub login_steps: LoginStepService,
    pub refresh: RefreshService,
    pub events: SharedEventPublisher,
    pub clock: SharedClock,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Assembles the repository and service graph over a database handle,
    /// using the HTTP provider gateway, the system clock and the log-backed
    /// event publisher.
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection) -> anyhow::Result<Self> {
        let gateway: Arc<dyn ProviderGateway> =
            Arc::new(HttpProviderGateway::new(&config.provider_gateway)?);
        Self::with_parts(
            config,
            db,
            gateway,
            Arc::new(LogEventPublisher),
            clock::system_clock(),
        )
    }

    /// Full-control variant for tests that substitute the provider gateway,
    /// the clock or the event publisher.
    pub fn with_parts(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        gateway: Arc<dyn ProviderGateway>,
        events: SharedEventPublisher,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        let db = Arc::new(db);

        let key_bytes = config
            .crypto_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("crypto key is not configured"))?;
        let crypto_key = CryptoKey::new(key_bytes)?;

        let sites = SiteRepository::new(Arc::clone(&db));
        let user_sites = UserSiteRepository::new(Arc::clone(&db), crypto_key, Arc::clone(&clock));
        let locks = UserSiteLockRepository::new(
            Arc::clone(&db),
            Arc::clone(&clock),
            Duration::minutes(config.lock_ttl_minutes),
        );
        let sessions = ConsentSessionRepository::new(Arc::clone(&db), Arc::clone(&clock));

        let refresh = RefreshService::new(
            user_sites.clone(),
            sites.clone(),
            locks.clone(),
            Arc::clone(&gateway),
            Arc::clone(&events),
            config.window.clone(),
            Arc::clone(&clock),
            config.disconnect_on_consent_expired,
        );
        let login_steps = LoginStepService::new(
            user_sites.clone(),
            sites.clone(),
            locks.clone(),
            sessions.clone(),
            gateway,
            Arc::clone(&events),
            refresh.clone(),
            Arc::clone(&clock),
            Duration::minutes(config.consent.step_timeout_minutes),
        );

        Ok(Self {
            config,
            db,
            sites,
            user_sites,
            locks,
            sessions,
            login_steps,
            refresh,
            events,
            clock,
        })
    }
}

/// Generates a per-request trace context, visible to handlers through the
/// request extensions and to error responses through the task-local.
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let context = TraceContext {
        trace_id: Uuid::new_v4().to_string(),
    };
    request.extensions_mut().insert(context.clone());
    telemetry::with_trace_context(context, next.run(request)).await
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/flows", post(handlers::flows::start_flow))
        .route("/logins", post(handlers::logins::process_login))
        .route("/user-sites", get(handlers::user_sites::list_user_sites))
        .route(
            "/user-sites/{id}/refresh",
            post(handlers::user_sites::refresh_user_site),
        )
        .route(
            "/user-sites/{id}",
            delete(handlers::user_sites::delete_user_site),
        )
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(axum::middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given configuration: applies migrations, seeds
/// the site registry, spawns the background loops and serves until a
/// shutdown signal arrives.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("Invalid server address")?;

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("Failed to apply migrations")?;
    seeds::seed_sites(&db).await?;

    let config = Arc::new(config);
    let state = AppState::new(Arc::clone(&config), db)?;

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    let cleanup = SessionCleanupService::new(
        config.cleanup.clone(),
        state.sessions.clone(),
        state.user_sites.clone(),
        state.locks.clone(),
        Arc::clone(&state.events),
        Arc::clone(&state.clock),
    );
    workers.push(tokio::spawn({
        let token = shutdown.clone();
        async move { cleanup.run(token).await }
    }));

    let flywheel = FlywheelService::new(
        config.flywheel.clone(),
        state.user_sites.clone(),
        state.refresh.clone(),
        Arc::clone(&state.clock),
    );
    workers.push(tokio::spawn({
        let token = shutdown.clone();
        async move { flywheel.run(token).await }
    }));

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    shutdown.cancel();
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("Background worker exited with error: {:?}", err),
            Err(err) => tracing::error!("Background worker panicked: {:?}", err),
        }
    }

    serve_result.context("Server error")?;
    Ok(())
}

/// Waits for SIGTERM or Ctrl+C, then cancels the shutdown token so the
/// background loops stop while the listener drains in-flight requests.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!("Failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
    shutdown.cancel();
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::flows::start_flow,
        crate::handlers::logins::process_login,
        crate::handlers::user_sites::list_user_sites,
        crate::handlers::user_sites::refresh_user_site,
        crate::handlers::user_sites::delete_user_site,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::user_site::ConnectionStatus,
            crate::models::user_site::FailureReason,
            crate::models::consent_session::Operation,
            crate::consent::steps::LoginStep,
            crate::consent::steps::FormStep,
            crate::consent::steps::RedirectStep,
            crate::consent::steps::Form,
            crate::consent::steps::FormComponent,
            crate::consent::steps::Login,
            crate::consent::steps::UrlLogin,
            crate::consent::steps::FormLogin,
            crate::consent::steps::StepResult,
            crate::handlers::flows::StartFlowBody,
            crate::handlers::flows::StartFlowResponse,
            crate::handlers::user_sites::UserSiteInfo,
            crate::handlers::user_sites::UserSitesResponse,
            crate::handlers::user_sites::RefreshResponse,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Sitelink API",
        description = "Bank connection lifecycle: consent flows, data refresh and connection management",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_state_requires_a_crypto_key() {
        let config = Arc::new(AppConfig::default());
        let result = AppState::new(config, DatabaseConnection::default());

        let err = result.expect_err("state built without a key");
        assert!(err.to_string().contains("crypto key"));
    }

    #[test]
    fn openapi_document_builds() {
        let doc = ApiDoc::openapi();
        let json = doc.to_json().expect("serialize openapi document");

        assert!(json.contains("/user-sites/{id}/refresh"));
        assert!(json.contains("bearer_auth"));
    }
}
