//! Login step processor
//!
//! Drives a consent flow from initiation to its terminal outcome. A flow is
//! born with a first step from the provider and a consent session keyed by a
//! single-use state token. Every inbound submission resolves its session by
//! that token, validates the payload against the pending step, and branches
//! on step counter, operation and provider kind. A flow ends in exactly one
//! of: access means stored and the connection handed to refresh, an external
//! scraping user accepted with the fetch running provider-side, another step
//! parked on the user, or a failure that leaves the connection unlocked with
//! an explicit status.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use metrics::counter;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::consent::steps::{self, Login, LoginStep, StepResult};
use crate::error::LifecycleError;
use crate::events::{SharedEventPublisher, SiteEvent};
use crate::models::ActionType;
use crate::models::consent_session::{self, Operation};
use crate::models::site::ProviderKind;
use crate::models::user_site::{self, ConnectionStatus, FailureReason};
use crate::providers::{
    AccessMeans, AccessMeansOrStep, AccessMeansRequest, ExternalUserRequest, LoginStepRequest,
    MfaRequest, ProviderError, ProviderGateway,
};
use crate::refresh::RefreshService;
use crate::repositories::{
    ConsentSessionRepository, NewConsentSession, NewUserSite, SiteRepository,
    UserSiteLockRepository, UserSiteRepository,
};

/// Parameters for opening a consent flow.
#[derive(Debug, Clone)]
pub struct StartFlowRequest {
    pub user_id: Uuid,
    pub client_id: String,
    pub operation: Operation,
    /// Site to connect; required for CREATE, ignored for UPDATE
    pub site_id: Option<Uuid>,
    /// Connection to renew; required for UPDATE
    pub user_site_id: Option<Uuid>,
    /// Redirect URL registration for CREATE; UPDATE reuses the stored one
    pub redirect_url_id: Option<Uuid>,
    pub psu_ip_address: Option<String>,
}

/// An opened flow: the first step to put in front of the user.
#[derive(Debug, Clone)]
pub struct StartedFlow {
    pub session_id: Uuid,
    /// Present for UPDATE flows; CREATE connections exist only after the
    /// first submission comes back
    pub user_site_id: Option<Uuid>,
    pub step: LoginStep,
}

/// Orchestrates login and consent flows end to end.
#[derive(Clone)]
pub struct LoginStepService {
    user_sites: UserSiteRepository,
    sites: SiteRepository,
    locks: UserSiteLockRepository,
    sessions: ConsentSessionRepository,
    gateway: Arc<dyn ProviderGateway>,
    events: SharedEventPublisher,
    refresh: RefreshService,
    clock: SharedClock,
    /// How long a connection may sit in STEP_NEEDED before the cleanup
    /// sweeper declares the flow dead
    step_timeout: Duration,
}

impl LoginStepService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_sites: UserSiteRepository,
        sites: SiteRepository,
        locks: UserSiteLockRepository,
        sessions: ConsentSessionRepository,
        gateway: Arc<dyn ProviderGateway>,
        events: SharedEventPublisher,
        refresh: RefreshService,
        clock: SharedClock,
        step_timeout: Duration,
    ) -> Self {
        Self {
            user_sites,
            sites,
            locks,
            sessions,
            gateway,
            events,
            refresh,
            clock,
            step_timeout,
        }
    }

    /// Opens a flow: asks the provider for the first login step and records
    /// a consent session around it. UPDATE flows additionally snapshot the
    /// connection's current standing so a failed renewal can roll back.
    #[instrument(skip_all, fields(operation = ?request.operation, user_id = %request.user_id))]
    pub async fn start_flow(&self, request: StartFlowRequest) -> Result<StartedFlow, LifecycleError> {
        match request.operation {
            Operation::Create => self.start_create(request).await,
            Operation::Update => self.start_update(request).await,
        }
    }

    async fn start_create(&self, request: StartFlowRequest) -> Result<StartedFlow, LifecycleError> {
        let site_id = request.site_id.ok_or_else(|| {
            LifecycleError::Protocol("siteId is required to start a CREATE flow".to_string())
        })?;
        let redirect_url_id = request.redirect_url_id.ok_or_else(|| {
            LifecycleError::Protocol("redirectUrlId is required to start a CREATE flow".to_string())
        })?;
        let site = self.sites.require(site_id).await?;

        let step = self
            .first_step(&site.provider, &request, site_id, redirect_url_id)
            .await?;

        let session = self
            .sessions
            .create(NewConsentSession {
                user_id: request.user_id,
                client_id: request.client_id,
                operation: Operation::Create,
                site_id,
                user_site_id: None,
                redirect_url_id,
                activity_id: Uuid::new_v4(),
                pending_step: Some(step.clone()),
                provider_state: step.provider_state().map(str::to_string),
                original_status: None,
                psu_ip_address: request.psu_ip_address,
            })
            .await?;

        let metric_labels = vec![("operation", "create".to_string())];
        counter!("consent_flows_started_total", &metric_labels).increment(1);
        info!(session_id = %session.id, site_id = %site_id, "Started CREATE consent flow");

        Ok(StartedFlow {
            session_id: session.id,
            user_site_id: None,
            step,
        })
    }

    async fn start_update(&self, request: StartFlowRequest) -> Result<StartedFlow, LifecycleError> {
        let user_site_id = request.user_site_id.ok_or_else(|| {
            LifecycleError::Protocol("userSiteId is required to start an UPDATE flow".to_string())
        })?;
        let user_site = self
            .user_sites
            .get(user_site_id)
            .await?
            .filter(|us| !us.is_deleted && us.user_id == request.user_id)
            .ok_or(LifecycleError::NotFound(user_site_id))?;

        let step = self
            .first_step(
                &user_site.provider,
                &request,
                user_site.site_id,
                user_site.redirect_url_id,
            )
            .await?;

        let session = self
            .sessions
            .create(NewConsentSession {
                user_id: request.user_id,
                client_id: user_site.client_id.clone(),
                operation: Operation::Update,
                site_id: user_site.site_id,
                user_site_id: Some(user_site.id),
                redirect_url_id: user_site.redirect_url_id,
                activity_id: Uuid::new_v4(),
                pending_step: Some(step.clone()),
                provider_state: step.provider_state().map(str::to_string),
                original_status: Some((user_site.status.clone(), user_site.failure_reason.clone())),
                psu_ip_address: request.psu_ip_address,
            })
            .await?;

        // The snapshot above is the rollback point; from here the connection
        // visibly waits on the user
        self.user_sites
            .update_status(
                user_site.id,
                ConnectionStatus::StepNeeded,
                None,
                Some(self.clock.now() + self.step_timeout),
            )
            .await?;

        let metric_labels = vec![("operation", "update".to_string())];
        counter!("consent_flows_started_total", &metric_labels).increment(1);
        info!(session_id = %session.id, user_site_id = %user_site.id, "Started UPDATE consent flow");

        Ok(StartedFlow {
            session_id: session.id,
            user_site_id: Some(user_site.id),
            step,
        })
    }

    async fn first_step(
        &self,
        provider: &str,
        request: &StartFlowRequest,
        site_id: Uuid,
        redirect_url_id: Uuid,
    ) -> Result<LoginStep, LifecycleError> {
        let login_request = LoginStepRequest {
            request_id: Uuid::new_v4(),
            user_id: request.user_id,
            site_id,
            redirect_url_id,
            state_id: steps::generate_state_id(),
            psu_ip_address: request.psu_ip_address.clone(),
        };
        Ok(self.gateway.get_login_step(provider, login_request).await?)
    }

    /// Processes one inbound login submission, either a filled form or the
    /// redirect the user came back on.
    ///
    /// Resolving the session consumes its state token, so a replayed or
    /// duplicated submission fails the lookup instead of re-running the flow.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn process_login(
        &self,
        user_id: Uuid,
        is_one_off_user: bool,
        login: Login,
        psu_ip_address: Option<String>,
    ) -> Result<StepResult, LifecycleError> {
        let posted_state = match &login {
            Login::Url(url_login) => steps::extract_state_from_redirect(&url_login.redirect_url)
                .ok_or_else(|| {
                    LifecycleError::Protocol("redirect URL carries no state parameter".to_string())
                })?,
            Login::Form(form_login) => form_login.state_id.clone(),
        };

        let Some(session) = self.sessions.find_by_state_and_rotate(&posted_state).await? else {
            return Err(LifecycleError::Protocol(
                "state token matches no open consent session".to_string(),
            ));
        };
        if session.user_id != user_id {
            return Err(LifecycleError::Protocol(
                "state token belongs to another user's session".to_string(),
            ));
        }

        // A bank-reported error with a pre-flow snapshot rolls the connection
        // back instead of pushing the broken redirect through the provider
        if let Login::Url(url_login) = &login {
            if redirect_reports_error(&url_login.redirect_url) && session.original_status.is_some()
            {
                return self.rollback_after_bank_error(&session).await;
            }
        }

        check_submission_shape(&session, &login)?;

        if session.step_number > 0 {
            return self
                .process_follow_up(&session, &login, &posted_state, is_one_off_user, psu_ip_address)
                .await;
        }

        match session.operation {
            Operation::Create => {
                self.process_first_create(&session, &login, &posted_state, is_one_off_user, psu_ip_address)
                    .await
            }
            Operation::Update => {
                self.process_first_update(&session, &login, &posted_state, is_one_off_user, psu_ip_address)
                    .await
            }
        }
    }

    async fn rollback_after_bank_error(
        &self,
        session: &consent_session::Model,
    ) -> Result<StepResult, LifecycleError> {
        let user_site_id = session.user_site_id.ok_or_else(|| {
            LifecycleError::Invariant(
                "status snapshot on a session with no connection".to_string(),
            )
        })?;

        warn!(
            user_site_id = %user_site_id,
            "Bank reported an error on redirect; restoring pre-flow status"
        );
        self.restore_snapshot(user_site_id, session).await?;
        self.sessions.delete(session.id).await?;

        let metric_labels = vec![("outcome", "bank_error".to_string())];
        counter!("consent_logins_failed_total", &metric_labels).increment(1);

        Ok(StepResult::LoginFailed { user_site_id })
    }

    /// Follow-up submissions answer a step the provider issued mid-flow. The
    /// connection must still be waiting on that step.
    async fn process_follow_up(
        &self,
        session: &consent_session::Model,
        login: &Login,
        posted_state: &str,
        is_one_off_user: bool,
        psu_ip_address: Option<String>,
    ) -> Result<StepResult, LifecycleError> {
        let user_site_id = session.user_site_id.ok_or_else(|| {
            LifecycleError::Invariant(format!(
                "session '{}' is {} steps in but has no connection",
                session.id, session.step_number
            ))
        })?;
        let user_site = self.user_sites.get(user_site_id).await?.ok_or_else(|| {
            LifecycleError::Invariant(format!(
                "session '{}' points at missing user site '{}'",
                session.id, user_site_id
            ))
        })?;
        if user_site.status != ConnectionStatus::StepNeeded {
            return Err(LifecycleError::Invariant(format!(
                "follow-up step posted for user site '{}' in status {:?}",
                user_site.id, user_site.status
            )));
        }

        let site = self.sites.require(user_site.site_id).await?;
        self.lock_for_session(&user_site, session).await?;

        match site.provider_kind {
            ProviderKind::DirectConnection => {
                self.exchange_access_means(
                    session,
                    &user_site,
                    login,
                    posted_state,
                    is_one_off_user,
                    psu_ip_address,
                )
                .await
            }
            ProviderKind::Scraping => self.submit_mfa_step(session, &user_site, login).await,
        }
    }

    /// First submission of a CREATE flow: this is the moment the connection
    /// comes into existence.
    async fn process_first_create(
        &self,
        session: &consent_session::Model,
        login: &Login,
        posted_state: &str,
        is_one_off_user: bool,
        psu_ip_address: Option<String>,
    ) -> Result<StepResult, LifecycleError> {
        let site = self.sites.require(session.site_id).await?;

        let user_site = self
            .user_sites
            .create(NewUserSite {
                user_id: session.user_id,
                client_id: session.client_id.clone(),
                site_id: site.id,
                provider: site.provider.clone(),
                redirect_url_id: session.redirect_url_id,
            })
            .await?;
        let session = self.sessions.set_user_site(session.id, user_site.id).await?;

        self.events
            .publish(SiteEvent::ConnectionCreated {
                user_site_id: user_site.id,
                user_id: session.user_id,
                site_id: site.id,
            })
            .await;
        info!(user_site_id = %user_site.id, site_id = %site.id, "Created user site from consent flow");

        self.lock_for_session(&user_site, &session).await?;

        match site.provider_kind {
            ProviderKind::DirectConnection => {
                self.exchange_access_means(
                    &session,
                    &user_site,
                    login,
                    posted_state,
                    is_one_off_user,
                    psu_ip_address,
                )
                .await
            }
            ProviderKind::Scraping => {
                self.create_external_user(&session, &user_site, login).await
            }
        }
    }

    /// First submission of an UPDATE flow against the existing connection.
    async fn process_first_update(
        &self,
        session: &consent_session::Model,
        login: &Login,
        posted_state: &str,
        is_one_off_user: bool,
        psu_ip_address: Option<String>,
    ) -> Result<StepResult, LifecycleError> {
        let user_site_id = session.user_site_id.ok_or_else(|| {
            LifecycleError::Invariant(format!("UPDATE session '{}' has no connection", session.id))
        })?;
        let user_site = self.user_sites.get(user_site_id).await?.ok_or_else(|| {
            LifecycleError::Invariant(format!(
                "session '{}' points at missing user site '{}'",
                session.id, user_site_id
            ))
        })?;
        if user_site.is_deleted {
            self.sessions.delete(session.id).await?;
            return Err(LifecycleError::NotFound(user_site_id));
        }

        let site = self.sites.require(user_site.site_id).await?;
        self.lock_for_session(&user_site, session).await?;

        match site.provider_kind {
            ProviderKind::DirectConnection => {
                self.exchange_access_means(
                    session,
                    &user_site,
                    login,
                    posted_state,
                    is_one_off_user,
                    psu_ip_address,
                )
                .await
            }
            ProviderKind::Scraping => self.create_external_user(session, &user_site, login).await,
        }
    }

    /// Exchanges a consent submission for access means. When the provider
    /// answers with yet another form step, remembered answers may complete it
    /// without bothering the user, at most once per inbound submission.
    async fn exchange_access_means(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
        login: &Login,
        posted_state: &str,
        is_one_off_user: bool,
        psu_ip_address: Option<String>,
    ) -> Result<StepResult, LifecycleError> {
        let (mut redirect_url, mut filled_form) = match login {
            Login::Url(url_login) => (Some(url_login.redirect_url.clone()), None),
            Login::Form(form_login) => (None, Some(form_login.filled_form.clone())),
        };
        let mut provider_state = session.provider_state.clone();
        let mut state_id = posted_state.to_string();
        let mut autocompleted = false;

        loop {
            let request = AccessMeansRequest {
                request_id: Uuid::new_v4(),
                user_id: session.user_id,
                user_site_id: user_site.id,
                redirect_url: redirect_url.take(),
                filled_form: filled_form.take(),
                provider_state: provider_state.clone(),
                state_id: state_id.clone(),
                psu_ip_address: psu_ip_address.clone(),
            };

            match self
                .gateway
                .create_access_means(&user_site.provider, request)
                .await
            {
                Ok(AccessMeansOrStep::Means(means)) => {
                    return self
                        .complete_direct_login(
                            session,
                            user_site,
                            login,
                            means,
                            is_one_off_user,
                            psu_ip_address,
                        )
                        .await;
                }
                Ok(AccessMeansOrStep::Step(step)) => {
                    self.sessions.replace_pending_step(session.id, &step).await?;

                    if !autocompleted {
                        if let LoginStep::Form(form_step) = &step {
                            if let Some(answers) = remembered_answers(user_site) {
                                if let Some(filled) = steps::autocomplete(&form_step.form, &answers)
                                {
                                    debug!(
                                        user_site_id = %user_site.id,
                                        "Auto-completing form step from remembered answers"
                                    );
                                    autocompleted = true;
                                    redirect_url = None;
                                    filled_form = Some(filled);
                                    provider_state = step.provider_state().map(str::to_string);
                                    state_id = step.state_id().to_string();
                                    continue;
                                }
                            }
                        }
                    }

                    return self.park_on_user(user_site, step).await;
                }
                Err(err) if err.is_functional() => {
                    return self
                        .fail_login(session, user_site, err.failure_reason(), "provider_rejected")
                        .await;
                }
                Err(err) => return self.fail_technical(session, user_site, err).await,
            }
        }
    }

    /// Parks the flow on the user: the connection waits in STEP_NEEDED and
    /// nothing stays locked while it does.
    async fn park_on_user(
        &self,
        user_site: &user_site::Model,
        step: LoginStep,
    ) -> Result<StepResult, LifecycleError> {
        self.user_sites
            .update_status(
                user_site.id,
                ConnectionStatus::StepNeeded,
                None,
                Some(self.clock.now() + self.step_timeout),
            )
            .await?;
        self.locks.unlock(user_site.id).await?;

        counter!("consent_steps_issued_total").increment(1);
        debug!(user_site_id = %user_site.id, "Provider issued a follow-up step");

        Ok(StepResult::NextStep {
            user_site_id: user_site.id,
            step,
        })
    }

    /// The provider granted access means: store them, mark the connection
    /// connected and hand it straight to refresh under the session's
    /// activity and lock.
    async fn complete_direct_login(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
        login: &Login,
        means: AccessMeans,
        is_one_off_user: bool,
        psu_ip_address: Option<String>,
    ) -> Result<StepResult, LifecycleError> {
        self.user_sites
            .set_access_means(user_site.id, &means.blob, means.created_at, means.expires_at)
            .await?;
        if let Login::Form(form_login) = login {
            self.user_sites
                .merge_persisted_answers(user_site.id, &form_login.filled_form)
                .await?;
        }
        self.user_sites
            .update_status(user_site.id, ConnectionStatus::Connected, None, None)
            .await?;
        self.sessions.delete(session.id).await?;

        let metric_labels = vec![("kind", "direct".to_string())];
        counter!("consent_logins_completed_total", &metric_labels).increment(1);
        info!(
            user_site_id = %user_site.id,
            activity_id = %session.activity_id,
            "Login completed; handing connection to refresh"
        );

        let refreshed = self.user_sites.require(user_site.id).await?;
        let action_type = match session.operation {
            Operation::Create => ActionType::CreateUserSite,
            Operation::Update => ActionType::UpdateUserSite,
        };
        let activity = self
            .refresh
            .refresh(
                vec![refreshed],
                is_one_off_user,
                action_type,
                psu_ip_address,
                Some(session.activity_id),
            )
            .await?;

        match activity {
            Some(activity_id) => Ok(StepResult::Activity {
                user_site_id: user_site.id,
                activity_id,
            }),
            None => {
                // Refresh declined the connection (one-off user with data
                // already fetched); nothing may stay locked behind it
                self.locks.unlock(user_site.id).await?;
                Ok(StepResult::NoActivity {
                    user_site_id: user_site.id,
                })
            }
        }
    }

    /// Sends credentials to a scraping provider, creating or re-crediting
    /// the external user that fetches on our behalf.
    async fn create_external_user(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
        login: &Login,
    ) -> Result<StepResult, LifecycleError> {
        let Login::Form(form_login) = login else {
            warn!(user_site_id = %user_site.id, "Redirect posted to a scraping connection");
            return self
                .fail_login(
                    session,
                    user_site,
                    FailureReason::AuthenticationFailed,
                    "redirect_to_scraping",
                )
                .await;
        };

        let request = ExternalUserRequest {
            request_id: Uuid::new_v4(),
            user_id: session.user_id,
            user_site_id: user_site.id,
            site_id: session.site_id,
            activity_id: session.activity_id,
            external_user_id: user_site.external_id,
            filled_form: form_login.filled_form.clone(),
        };
        match self
            .gateway
            .create_external_user(&user_site.provider, request)
            .await
        {
            Ok(external_user_id) => {
                self.user_sites
                    .set_external_id(user_site.id, external_user_id)
                    .await?;
                self.user_sites
                    .merge_persisted_answers(user_site.id, &form_login.filled_form)
                    .await?;
                self.complete_scraping_operation(session, user_site).await
            }
            Err(err) if err.is_functional() => {
                self.fail_login(session, user_site, err.failure_reason(), "provider_rejected")
                    .await
            }
            Err(err) => self.fail_technical(session, user_site, err).await,
        }
    }

    /// Answers an MFA form step on an already-created external user.
    async fn submit_mfa_step(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
        login: &Login,
    ) -> Result<StepResult, LifecycleError> {
        let Login::Form(form_login) = login else {
            warn!(user_site_id = %user_site.id, "Redirect posted to a scraping connection");
            return self
                .fail_login(
                    session,
                    user_site,
                    FailureReason::AuthenticationFailed,
                    "redirect_to_scraping",
                )
                .await;
        };
        let external_user_id = user_site.external_id.ok_or_else(|| {
            LifecycleError::Invariant(format!(
                "scraping user site '{}' got an MFA step before an external user existed",
                user_site.id
            ))
        })?;

        let request = MfaRequest {
            request_id: Uuid::new_v4(),
            external_user_id,
            activity_id: session.activity_id,
            filled_form: form_login.filled_form.clone(),
            provider_state: session.provider_state.clone(),
        };
        match self.gateway.submit_mfa(&user_site.provider, request).await {
            Ok(()) => {
                self.user_sites
                    .merge_persisted_answers(user_site.id, &form_login.filled_form)
                    .await?;
                self.complete_scraping_operation(session, user_site).await
            }
            Err(err) if err.is_functional() => {
                self.fail_login(session, user_site, err.failure_reason(), "provider_rejected")
                    .await
            }
            Err(err) => self.fail_technical(session, user_site, err).await,
        }
    }

    /// A scraping provider fetches as part of the operation it just
    /// accepted, so the connection stays locked under the session activity
    /// until the provider-side operation lands.
    async fn complete_scraping_operation(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
    ) -> Result<StepResult, LifecycleError> {
        self.user_sites
            .update_status(user_site.id, ConnectionStatus::Connected, None, None)
            .await?;
        self.sessions.delete(session.id).await?;

        let metric_labels = vec![("kind", "scraping".to_string())];
        counter!("consent_logins_completed_total", &metric_labels).increment(1);
        info!(
            user_site_id = %user_site.id,
            activity_id = %session.activity_id,
            "Scraping login accepted; fetch runs inside the provider operation"
        );

        Ok(StepResult::Activity {
            user_site_id: user_site.id,
            activity_id: session.activity_id,
        })
    }

    /// Takes the activity lock before provider work. Losing the race is
    /// logged rather than fatal so a user is never walled off from finishing
    /// a login they are halfway through.
    async fn lock_for_session(
        &self,
        user_site: &user_site::Model,
        session: &consent_session::Model,
    ) -> Result<(), LifecycleError> {
        let locked = self
            .locks
            .attempt_lock(user_site.id, session.activity_id)
            .await?;
        if !locked {
            warn!(
                user_site_id = %user_site.id,
                activity_id = %session.activity_id,
                "User site is locked by another activity; continuing login without exclusivity"
            );
        }
        Ok(())
    }

    /// Terminal functional failure: the user's login was rejected. Rolls
    /// back to the snapshot when one exists, otherwise lands on disconnected
    /// with the provider's reason, then releases everything the flow held.
    async fn fail_login(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
        reason: FailureReason,
        outcome: &str,
    ) -> Result<StepResult, LifecycleError> {
        if session.original_status.is_some() {
            self.restore_snapshot(user_site.id, session).await?;
        } else {
            self.user_sites
                .update_status(
                    user_site.id,
                    ConnectionStatus::Disconnected,
                    Some(reason.clone()),
                    None,
                )
                .await?;
            self.events
                .publish(SiteEvent::ConnectionStatusChanged {
                    user_site_id: user_site.id,
                    status: ConnectionStatus::Disconnected,
                    failure_reason: Some(reason),
                })
                .await;
        }
        self.locks.unlock(user_site.id).await?;
        self.sessions.delete(session.id).await?;

        let metric_labels = vec![("outcome", outcome.to_string())];
        counter!("consent_logins_failed_total", &metric_labels).increment(1);

        Ok(StepResult::LoginFailed {
            user_site_id: user_site.id,
        })
    }

    /// Terminal technical failure: the provider call itself fell over. The
    /// connection keeps its connected standing when the snapshot says it had
    /// one, gains a TECHNICAL_ERROR reason, and the error propagates.
    async fn fail_technical(
        &self,
        session: &consent_session::Model,
        user_site: &user_site::Model,
        err: ProviderError,
    ) -> Result<StepResult, LifecycleError> {
        let status = match &session.original_status {
            Some(ConnectionStatus::Connected) => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        };
        self.user_sites
            .update_status(
                user_site.id,
                status.clone(),
                Some(FailureReason::TechnicalError),
                None,
            )
            .await?;
        self.events
            .publish(SiteEvent::ConnectionStatusChanged {
                user_site_id: user_site.id,
                status,
                failure_reason: Some(FailureReason::TechnicalError),
            })
            .await;
        self.locks.unlock(user_site.id).await?;
        self.sessions.delete(session.id).await?;

        let metric_labels = vec![("outcome", "technical".to_string())];
        counter!("consent_logins_failed_total", &metric_labels).increment(1);

        Err(LifecycleError::Gateway(err))
    }

    async fn restore_snapshot(
        &self,
        user_site_id: Uuid,
        session: &consent_session::Model,
    ) -> Result<(), LifecycleError> {
        let (status, reason) = rollback_target(session);
        self.user_sites
            .update_status(user_site_id, status.clone(), reason.clone(), None)
            .await?;
        self.events
            .publish(SiteEvent::ConnectionStatusChanged {
                user_site_id,
                status,
                failure_reason: reason,
            })
            .await;
        Ok(())
    }
}

/// What a connection rolls back to when its flow dies: the pre-flow snapshot
/// when one exists and is restorable, otherwise disconnected with an
/// authentication failure. A STEP_NEEDED snapshot is not restorable because
/// the step it pointed at died with its own session.
pub(crate) fn rollback_target(
    session: &consent_session::Model,
) -> (ConnectionStatus, Option<FailureReason>) {
    match &session.original_status {
        Some(status) if *status != ConnectionStatus::StepNeeded => {
            (status.clone(), session.original_failure_reason.clone())
        }
        _ => (
            ConnectionStatus::Disconnected,
            Some(FailureReason::AuthenticationFailed),
        ),
    }
}

/// A submission must answer the step shape the session is waiting on: forms
/// answer form steps, redirects answer redirect steps. A redirect is also
/// legal on a first post with no stored step, where the client obtained the
/// consent URL out of band.
fn check_submission_shape(
    session: &consent_session::Model,
    login: &Login,
) -> Result<(), LifecycleError> {
    let pending = steps::pending_step(session)?;
    match (login, &pending) {
        (Login::Form(form_login), Some(LoginStep::Form(step))) => {
            steps::validate_filled_form(&step.form, &form_login.filled_form)?;
            Ok(())
        }
        (Login::Form(_), _) => Err(LifecycleError::Protocol(
            "form answers posted but no form step is pending".to_string(),
        )),
        (Login::Url(_), Some(LoginStep::Redirect(_))) => Ok(()),
        (Login::Url(_), None) if session.step_number == 0 => Ok(()),
        (Login::Url(_), _) => Err(LifecycleError::Protocol(
            "redirect posted but a form step is pending".to_string(),
        )),
    }
}

fn remembered_answers(user_site: &user_site::Model) -> Option<BTreeMap<String, String>> {
    user_site
        .persisted_form_answers
        .as_ref()
        .and_then(|json| serde_json::from_value(json.clone()).ok())
}

/// Whether a bank redirect carries an error report instead of a grant.
fn redirect_reports_error(redirect_url: &str) -> bool {
    url::Url::parse(redirect_url)
        .map(|url| url.query_pairs().any(|(key, _)| key == "error"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::steps::{Form, FormComponent, FormLogin, FormStep, UrlLogin};
    use chrono::Utc;

    fn session_with(step: Option<&LoginStep>, step_number: i32) -> consent_session::Model {
        let (form_step, redirect_step) = match step {
            Some(step) => steps::step_columns(step).expect("step serializes"),
            None => (None, None),
        };
        consent_session::Model {
            id: Uuid::new_v4(),
            state_id: "rotated".to_string(),
            user_id: Uuid::new_v4(),
            client_id: "acme".to_string(),
            operation: Operation::Create,
            site_id: Uuid::new_v4(),
            user_site_id: None,
            redirect_url_id: Uuid::new_v4(),
            activity_id: Uuid::new_v4(),
            step_number,
            form_step,
            redirect_step,
            provider_state: None,
            original_status: None,
            original_failure_reason: None,
            psu_ip_address: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    fn form_step() -> LoginStep {
        LoginStep::Form(FormStep {
            form: Form {
                components: vec![FormComponent {
                    id: "username".to_string(),
                    display_name: "Username".to_string(),
                    optional: false,
                }],
            },
            encryption_details: None,
            provider_state: None,
            state_id: "issued".to_string(),
        })
    }

    #[test]
    fn rollback_restores_a_connected_snapshot() {
        let mut session = session_with(None, 0);
        session.original_status = Some(ConnectionStatus::Connected);
        session.original_failure_reason = None;

        let (status, reason) = rollback_target(&session);
        assert_eq!(status, ConnectionStatus::Connected);
        assert_eq!(reason, None);
    }

    #[test]
    fn rollback_treats_a_step_needed_snapshot_as_lost() {
        let mut session = session_with(None, 0);
        session.original_status = Some(ConnectionStatus::StepNeeded);

        let (status, reason) = rollback_target(&session);
        assert_eq!(status, ConnectionStatus::Disconnected);
        assert_eq!(reason, Some(FailureReason::AuthenticationFailed));
    }

    #[test]
    fn rollback_without_snapshot_lands_on_auth_failure() {
        let session = session_with(None, 0);

        let (status, reason) = rollback_target(&session);
        assert_eq!(status, ConnectionStatus::Disconnected);
        assert_eq!(reason, Some(FailureReason::AuthenticationFailed));
    }

    #[test]
    fn form_submission_requires_a_pending_form_step() {
        let session = session_with(None, 0);
        let login = Login::Form(FormLogin {
            state_id: "tok".to_string(),
            filled_form: BTreeMap::from([("username".to_string(), "jane".to_string())]),
        });

        let err = check_submission_shape(&session, &login).unwrap_err();
        assert!(matches!(err, LifecycleError::Protocol(_)));
    }

    #[test]
    fn form_submission_is_validated_against_the_pending_form() {
        let step = form_step();
        let session = session_with(Some(&step), 1);
        let login = Login::Form(FormLogin {
            state_id: "tok".to_string(),
            filled_form: BTreeMap::new(),
        });

        let err = check_submission_shape(&session, &login).unwrap_err();
        assert!(matches!(err, LifecycleError::Protocol(_)));

        let login = Login::Form(FormLogin {
            state_id: "tok".to_string(),
            filled_form: BTreeMap::from([("username".to_string(), "jane".to_string())]),
        });
        assert!(check_submission_shape(&session, &login).is_ok());
    }

    #[test]
    fn first_redirect_without_stored_step_is_accepted() {
        let session = session_with(None, 0);
        let login = Login::Url(UrlLogin {
            redirect_url: "https://client.example/cb?state=tok&code=ok".to_string(),
        });

        assert!(check_submission_shape(&session, &login).is_ok());
    }

    #[test]
    fn redirect_against_a_pending_form_step_is_rejected() {
        let step = form_step();
        let session = session_with(Some(&step), 1);
        let login = Login::Url(UrlLogin {
            redirect_url: "https://client.example/cb?state=tok".to_string(),
        });

        let err = check_submission_shape(&session, &login).unwrap_err();
        assert!(matches!(err, LifecycleError::Protocol(_)));
    }

    #[test]
    fn bank_error_detection_keys_on_the_error_parameter() {
        assert!(redirect_reports_error(
            "https://client.example/cb?state=tok&error=access_denied"
        ));
        assert!(!redirect_reports_error(
            "https://client.example/cb?state=tok&code=grant"
        ));
        assert!(!redirect_reports_error("not a url"));
    }
}
