//! Shared fixtures for the integration suites.
//!
//! Builds the repository and service graph over an in-memory SQLite database
//! with a manually advanced clock, a scriptable provider gateway and an
//! event publisher that records instead of logging.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Set, Statement};
use uuid::Uuid;

use sitelink::clock::{ManualClock, SharedClock};
use sitelink::consent::LoginStepService;
use sitelink::consent::steps::{self, Form, FormComponent, FormStep, LoginStep, RedirectStep};
use sitelink::crypto::CryptoKey;
use sitelink::events::{EventPublisher, SharedEventPublisher, SiteEvent};
use sitelink::models::site::{self, ProviderKind};
use sitelink::models::user_site::{self, ConnectionStatus};
use sitelink::providers::{
    AccessMeans, AccessMeansOrStep, AccessMeansRequest, ExternalUserRequest, FetchTriggerRequest,
    LoginStepRequest, MfaRequest, ProviderError, ProviderGateway, RenewMeansRequest,
};
use sitelink::refresh::{FetchWindowConfig, RefreshService};
use sitelink::repositories::{
    ConsentSessionRepository, NewUserSite, SiteRepository, UserSiteLockRepository,
    UserSiteRepository,
};

/// Lock TTL the harness repositories are built with.
pub const LOCK_TTL_MINUTES: i64 = 10;

/// STEP_NEEDED timeout the harness login service is built with.
pub const STEP_TIMEOUT_MINUTES: i64 = 15;

/// Fixed instant every harness clock starts at.
pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // SQLite leaves foreign keys unenforced by default; keep it that way so
    // fixture rows can stand alone without their parent rows.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Arc-wrapped variant for callers building repositories directly.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

type Scripted<T> = Mutex<VecDeque<Result<T, ProviderError>>>;

fn pop<T>(queue: &Scripted<T>) -> Option<Result<T, ProviderError>> {
    queue.lock().unwrap().pop_front()
}

fn push<T>(queue: &Scripted<T>, result: Result<T, ProviderError>) {
    queue.lock().unwrap().push_back(result);
}

/// Scriptable stand-in for the provider adapter fleet.
///
/// Each call pops the next scripted result for that call, or falls back to a
/// benign default so happy paths need no scripting at all. Every request is
/// recorded for assertions.
#[derive(Default)]
pub struct StubGateway {
    login_steps: Scripted<LoginStep>,
    access_means: Scripted<AccessMeansOrStep>,
    renewals: Scripted<AccessMeans>,
    mfa_acks: Scripted<()>,
    fetch_acks: Scripted<()>,
    external_users: Scripted<Uuid>,

    pub login_step_requests: Mutex<Vec<LoginStepRequest>>,
    pub access_means_requests: Mutex<Vec<AccessMeansRequest>>,
    pub renewal_requests: Mutex<Vec<RenewMeansRequest>>,
    pub mfa_requests: Mutex<Vec<MfaRequest>>,
    pub fetch_requests: Mutex<Vec<FetchTriggerRequest>>,
    pub external_user_requests: Mutex<Vec<ExternalUserRequest>>,
}

impl StubGateway {
    pub fn queue_login_step(&self, result: Result<LoginStep, ProviderError>) {
        push(&self.login_steps, result);
    }

    pub fn queue_access_means(&self, result: Result<AccessMeansOrStep, ProviderError>) {
        push(&self.access_means, result);
    }

    pub fn queue_renewal(&self, result: Result<AccessMeans, ProviderError>) {
        push(&self.renewals, result);
    }

    pub fn queue_mfa(&self, result: Result<(), ProviderError>) {
        push(&self.mfa_acks, result);
    }

    pub fn queue_fetch(&self, result: Result<(), ProviderError>) {
        push(&self.fetch_acks, result);
    }

    pub fn queue_external_user(&self, result: Result<Uuid, ProviderError>) {
        push(&self.external_users, result);
    }

    pub fn fetch_request_count(&self) -> usize {
        self.fetch_requests.lock().unwrap().len()
    }

    pub fn access_means_call_count(&self) -> usize {
        self.access_means_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderGateway for StubGateway {
    async fn get_login_step(
        &self,
        _provider: &str,
        request: LoginStepRequest,
    ) -> Result<LoginStep, ProviderError> {
        self.login_step_requests.lock().unwrap().push(request);
        pop(&self.login_steps)
            .unwrap_or_else(|| Ok(redirect_step(&steps::generate_state_id())))
    }

    async fn create_access_means(
        &self,
        _provider: &str,
        request: AccessMeansRequest,
    ) -> Result<AccessMeansOrStep, ProviderError> {
        self.access_means_requests.lock().unwrap().push(request);
        pop(&self.access_means)
            .unwrap_or_else(|| Ok(AccessMeansOrStep::Means(access_means("specimen-means"))))
    }

    async fn renew_access_means(
        &self,
        _provider: &str,
        request: RenewMeansRequest,
    ) -> Result<AccessMeans, ProviderError> {
        self.renewal_requests.lock().unwrap().push(request);
        pop(&self.renewals).unwrap_or_else(|| Ok(access_means("renewed-means")))
    }

    async fn submit_mfa(&self, _provider: &str, request: MfaRequest) -> Result<(), ProviderError> {
        self.mfa_requests.lock().unwrap().push(request);
        pop(&self.mfa_acks).unwrap_or(Ok(()))
    }

    async fn trigger_fetch(
        &self,
        _provider: &str,
        request: FetchTriggerRequest,
    ) -> Result<(), ProviderError> {
        self.fetch_requests.lock().unwrap().push(request);
        pop(&self.fetch_acks).unwrap_or(Ok(()))
    }

    async fn create_external_user(
        &self,
        _provider: &str,
        request: ExternalUserRequest,
    ) -> Result<Uuid, ProviderError> {
        self.external_user_requests.lock().unwrap().push(request);
        pop(&self.external_users).unwrap_or_else(|| Ok(Uuid::new_v4()))
    }
}

/// Publisher that records every event instead of logging it.
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<SiteEvent>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: SiteEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingPublisher {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(SiteEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }
}

/// A redirect step carrying the given state token.
pub fn redirect_step(state_id: &str) -> LoginStep {
    LoginStep::Redirect(RedirectStep {
        redirect_url: format!("https://bank.example.com/auth?state={state_id}"),
        external_consent_id: None,
        provider_state: None,
        state_id: state_id.to_string(),
    })
}

/// A form step carrying the given state token and `(field id, optional)`
/// components.
pub fn form_step(state_id: &str, fields: &[(&str, bool)]) -> LoginStep {
    LoginStep::Form(FormStep {
        form: Form {
            components: fields
                .iter()
                .map(|(id, optional)| FormComponent {
                    id: id.to_string(),
                    display_name: id.to_string(),
                    optional: *optional,
                })
                .collect(),
        },
        encryption_details: None,
        provider_state: None,
        state_id: state_id.to_string(),
    })
}

/// Access means created now with no expiry.
pub fn access_means(blob: &str) -> AccessMeans {
    AccessMeans {
        blob: blob.to_string(),
        created_at: Utc::now(),
        expires_at: None,
    }
}

/// The full repository and service graph over one test database.
pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<StubGateway>,
    pub events: Arc<RecordingPublisher>,
    pub sites: SiteRepository,
    pub user_sites: UserSiteRepository,
    pub locks: UserSiteLockRepository,
    pub sessions: ConsentSessionRepository,
    pub refresh: RefreshService,
    pub login_steps: LoginStepService,
}

pub async fn harness() -> Result<Harness> {
    harness_with_policy(false).await
}

pub async fn harness_with_policy(disconnect_on_consent_expired: bool) -> Result<Harness> {
    let db = setup_test_db_arc().await?;
    let clock = Arc::new(ManualClock::new(test_start()));
    let shared_clock: SharedClock = clock.clone();
    let gateway = Arc::new(StubGateway::default());
    let events = Arc::new(RecordingPublisher::default());
    let shared_events: SharedEventPublisher = events.clone();

    let crypto_key = CryptoKey::new(vec![7u8; 32])?;
    let sites = SiteRepository::new(Arc::clone(&db));
    let user_sites =
        UserSiteRepository::new(Arc::clone(&db), crypto_key, Arc::clone(&shared_clock));
    let locks = UserSiteLockRepository::new(
        Arc::clone(&db),
        Arc::clone(&shared_clock),
        Duration::minutes(LOCK_TTL_MINUTES),
    );
    let sessions = ConsentSessionRepository::new(Arc::clone(&db), Arc::clone(&shared_clock));

    let refresh = RefreshService::new(
        user_sites.clone(),
        sites.clone(),
        locks.clone(),
        gateway.clone() as Arc<dyn ProviderGateway>,
        shared_events.clone(),
        FetchWindowConfig::default(),
        Arc::clone(&shared_clock),
        disconnect_on_consent_expired,
    );
    let login_steps = LoginStepService::new(
        user_sites.clone(),
        sites.clone(),
        locks.clone(),
        sessions.clone(),
        gateway.clone() as Arc<dyn ProviderGateway>,
        shared_events,
        refresh.clone(),
        shared_clock,
        Duration::minutes(STEP_TIMEOUT_MINUTES),
    );

    Ok(Harness {
        db,
        clock,
        gateway,
        events,
        sites,
        user_sites,
        locks,
        sessions,
        refresh,
        login_steps,
    })
}

impl Harness {
    pub async fn seed_site(
        &self,
        name: &str,
        provider: &str,
        kind: ProviderKind,
    ) -> Result<site::Model> {
        let active = site::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            provider: Set(provider.to_string()),
            provider_kind: Set(kind),
            created_at: Set(self.clock.now().into()),
        };
        self.sites.create(active).await
    }

    /// A fresh connection row in its initial DISCONNECTED state.
    pub async fn user_site_for(
        &self,
        site: &site::Model,
        user_id: Uuid,
    ) -> Result<user_site::Model> {
        self.user_sites
            .create(NewUserSite {
                user_id,
                client_id: "acme".to_string(),
                site_id: site.id,
                provider: site.provider.clone(),
                redirect_url_id: Uuid::new_v4(),
            })
            .await
    }

    /// A connected direct-connection row with stored access means.
    pub async fn connected_user_site(
        &self,
        site: &site::Model,
        user_id: Uuid,
    ) -> Result<user_site::Model> {
        let us = self.user_site_for(site, user_id).await?;
        self.user_sites
            .set_access_means(us.id, "specimen-means", self.clock.now(), None)
            .await?;
        self.user_sites
            .update_status(us.id, ConnectionStatus::Connected, None, None)
            .await?;
        self.user_sites.require(us.id).await
    }

    /// A connected scraping row with its external bank-side identity.
    pub async fn connected_scraping_user_site(
        &self,
        site: &site::Model,
        user_id: Uuid,
    ) -> Result<user_site::Model> {
        let us = self.user_site_for(site, user_id).await?;
        self.user_sites.set_external_id(us.id, Uuid::new_v4()).await?;
        self.user_sites
            .update_status(us.id, ConnectionStatus::Connected, None, None)
            .await?;
        self.user_sites.require(us.id).await
    }
}
