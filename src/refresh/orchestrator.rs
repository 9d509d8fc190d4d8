//! Batch refresh orchestrator
//!
//! Fans a data-fetch out over many connections under one activity id, with
//! per-connection failure isolation: one bank rejecting its refresh never
//! touches its batch neighbours. The exit contract is strict. Every locked
//! connection leaves this code either still locked with a fetch in flight and
//! a clean CONNECTED status, or unlocked with an explicit status, a failure
//! reason and a failure event. Nothing stays locked with no outstanding work.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::events::{SharedEventPublisher, SiteEvent};
use crate::models::site::ProviderKind;
use crate::models::user_site::{ConnectionStatus, FailureReason};
use crate::models::{ActionType, site, user_site};
use crate::providers::{FetchTriggerRequest, ProviderError, ProviderGateway, RenewMeansRequest};
use crate::repositories::{SiteRepository, UserSiteLockRepository, UserSiteRepository};

use super::window::{FetchWindowConfig, WindowInputs, fetch_lower_bound};

use crate::error::LifecycleError;

/// Renew access means this close to their expiry instead of fetching on them.
const MEANS_RENEWAL_MARGIN_MINUTES: i64 = 30;

/// How access-means resolution can go wrong for one connection.
enum ResolveFailure {
    /// Provider adapter said no; absorbed into connection state.
    Provider(ProviderError),
    /// Storage gave out mid-handling; bubbles to the catch-up pass.
    Unexpected(anyhow::Error),
}

#[derive(Clone)]
pub struct RefreshService {
    user_sites: UserSiteRepository,
    sites: SiteRepository,
    locks: UserSiteLockRepository,
    gateway: Arc<dyn ProviderGateway>,
    events: SharedEventPublisher,
    window: FetchWindowConfig,
    clock: SharedClock,
    /// Whether a provider-reported consent expiry disconnects immediately
    disconnect_on_consent_expired: bool,
}

impl RefreshService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_sites: UserSiteRepository,
        sites: SiteRepository,
        locks: UserSiteLockRepository,
        gateway: Arc<dyn ProviderGateway>,
        events: SharedEventPublisher,
        window: FetchWindowConfig,
        clock: SharedClock,
        disconnect_on_consent_expired: bool,
    ) -> Self {
        Self {
            user_sites,
            sites,
            locks,
            gateway,
            events,
            window,
            clock,
            disconnect_on_consent_expired,
        }
    }

    /// Refresh a batch of connections under one activity.
    ///
    /// Returns the activity id when at least one connection got locked and
    /// entered the batch, `None` when there was nothing to do. Callers that
    /// already hold locks pass their activity id; every connection must then
    /// be locked under exactly that id (an unlocked one is acquired on the
    /// fly, one locked by somebody else fails the whole batch before any
    /// event is sent).
    pub async fn refresh(
        &self,
        user_sites: Vec<user_site::Model>,
        is_one_off_user: bool,
        action_type: ActionType,
        psu_ip_address: Option<String>,
        existing_activity_id: Option<Uuid>,
    ) -> Result<Option<Uuid>, LifecycleError> {
        // One-off users get exactly one fetch, ever
        let user_sites: Vec<user_site::Model> = if is_one_off_user {
            user_sites
                .into_iter()
                .filter(|us| us.last_data_fetch.is_none())
                .collect()
        } else {
            user_sites
        };

        if user_sites.is_empty() {
            return Ok(None);
        }
        if user_sites.len() > 1 && !action_type.allows_batch() {
            return Err(LifecycleError::Invariant(format!(
                "batch of {} connections is not allowed for action type {:?}",
                user_sites.len(),
                action_type
            )));
        }

        let sites_by_id = self.load_sites(&user_sites).await?;

        if action_type == ActionType::CreateUserSite {
            let scraping = user_sites.iter().find(|us| {
                sites_by_id
                    .get(&us.site_id)
                    .is_some_and(|site| site.provider_kind == ProviderKind::Scraping)
            });
            if let Some(us) = scraping {
                return Err(LifecycleError::Invariant(format!(
                    "scraping connection '{}' fetches inside its create operation and must not be triggered separately",
                    us.id
                )));
            }
        }

        let (activity_id, locked) = match existing_activity_id {
            Some(activity_id) => {
                let locked = self.verify_locked(&user_sites, activity_id).await?;
                (activity_id, locked)
            }
            None => {
                let activity_id = Uuid::new_v4();
                let locked = self.lock_eligible(&user_sites, activity_id).await?;
                (activity_id, locked)
            }
        };

        let Some(first) = locked.first() else {
            debug!(action_type = ?action_type, "No connections locked, nothing to refresh");
            return Ok(None);
        };

        counter!("refresh_batches_started_total").increment(1);
        info!(
            activity_id = %activity_id,
            user_id = %first.user_id,
            connections = locked.len(),
            action_type = ?action_type,
            "Starting refresh batch"
        );
        self.events
            .publish(SiteEvent::RefreshStarted {
                activity_id,
                user_id: first.user_id,
                user_site_ids: locked.iter().map(|us| us.id).collect(),
                action_type,
            })
            .await;

        for (index, us) in locked.iter().enumerate() {
            let site = sites_by_id.get(&us.site_id);
            if let Err(err) = self
                .fetch_one(activity_id, us, site, psu_ip_address.as_deref())
                .await
            {
                error!(
                    activity_id = %activity_id,
                    user_site_id = %us.id,
                    "Refresh batch aborted mid-flight: {:#}",
                    err
                );
                self.abandon(activity_id, &locked[index..]).await;
                return Err(LifecycleError::Storage(err));
            }
        }

        Ok(Some(activity_id))
    }

    /// Fire-and-forget variant for callers that must return before the bank
    /// round-trip completes. Same semantics, dispatched on the runtime.
    pub fn refresh_detached(
        &self,
        user_sites: Vec<user_site::Model>,
        is_one_off_user: bool,
        action_type: ActionType,
        psu_ip_address: Option<String>,
        existing_activity_id: Option<Uuid>,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service
                .refresh(
                    user_sites,
                    is_one_off_user,
                    action_type,
                    psu_ip_address,
                    existing_activity_id,
                )
                .await
            {
                error!("Detached refresh failed: {}", err);
            }
        });
    }

    async fn load_sites(
        &self,
        user_sites: &[user_site::Model],
    ) -> Result<BTreeMap<Uuid, site::Model>, LifecycleError> {
        let mut sites_by_id = BTreeMap::new();
        for us in user_sites {
            if !sites_by_id.contains_key(&us.site_id) {
                let site = self.sites.require(us.site_id).await?;
                sites_by_id.insert(us.site_id, site);
            }
        }
        Ok(sites_by_id)
    }

    /// Locks every eligible connection under a fresh activity. Connections
    /// mid-migration, waiting on a user step or failed in a way only the
    /// user can fix are skipped; so are ones already locked by someone else.
    async fn lock_eligible(
        &self,
        user_sites: &[user_site::Model],
        activity_id: Uuid,
    ) -> Result<Vec<user_site::Model>, LifecycleError> {
        let mut locked = Vec::new();
        for us in user_sites {
            if !eligible_for_refresh(us) {
                debug!(user_site_id = %us.id, status = ?us.status, "Skipping ineligible connection");
                continue;
            }
            if self
                .locks
                .attempt_lock(us.id, activity_id)
                .await
                .map_err(LifecycleError::Storage)?
            {
                locked.push(us.clone());
            }
        }
        Ok(locked)
    }

    /// Verifies connections the caller claims to have pre-locked. A lock held
    /// under a different activity fails the batch; a missing lock is taken
    /// over on the fly.
    async fn verify_locked(
        &self,
        user_sites: &[user_site::Model],
        activity_id: Uuid,
    ) -> Result<Vec<user_site::Model>, LifecycleError> {
        let mut locked = Vec::new();
        for us in user_sites {
            match self
                .locks
                .holder(us.id)
                .await
                .map_err(LifecycleError::Storage)?
            {
                Some(holder) if holder == activity_id => locked.push(us.clone()),
                Some(other) => {
                    return Err(LifecycleError::Invariant(format!(
                        "user site '{}' is locked under activity '{}', expected '{}'",
                        us.id, other, activity_id
                    )));
                }
                None => {
                    if self
                        .locks
                        .attempt_lock(us.id, activity_id)
                        .await
                        .map_err(LifecycleError::Storage)?
                    {
                        warn!(
                            user_site_id = %us.id,
                            activity_id = %activity_id,
                            "Connection was not locked as claimed, acquired on the fly"
                        );
                        locked.push(us.clone());
                    } else {
                        return Err(LifecycleError::Invariant(format!(
                            "user site '{}' was grabbed by another activity during verification",
                            us.id
                        )));
                    }
                }
            }
        }
        Ok(locked)
    }

    /// One connection's share of the batch. `Ok` means the connection exited
    /// per contract, whether the fetch flies or the failure got absorbed;
    /// `Err` means storage failed mid-handling and the catch-up pass runs.
    async fn fetch_one(
        &self,
        activity_id: Uuid,
        us: &user_site::Model,
        site: Option<&site::Model>,
        psu_ip_address: Option<&str>,
    ) -> anyhow::Result<()> {
        let site =
            site.ok_or_else(|| anyhow!("site '{}' missing for user site '{}'", us.site_id, us.id))?;

        let request = match site.provider_kind {
            ProviderKind::DirectConnection => {
                let means = match self.resolve_access_means(us, psu_ip_address).await {
                    Ok(Some(means)) => means,
                    Ok(None) => {
                        // No means at all: the user must log in again
                        self.fail_connection(
                            activity_id,
                            us,
                            ConnectionStatus::Disconnected,
                            FailureReason::AuthenticationFailed,
                        )
                        .await?;
                        return Ok(());
                    }
                    Err(ResolveFailure::Provider(err)) => {
                        self.fail_with_provider_error(activity_id, us, &err).await?;
                        return Ok(());
                    }
                    Err(ResolveFailure::Unexpected(err)) => return Err(err),
                };
                FetchTriggerRequest::DirectApi {
                    request_id: Uuid::new_v4(),
                    user_site_id: us.id,
                    activity_id,
                    access_means: means,
                    fetch_from: self.window_for(us, site),
                    psu_ip_address: psu_ip_address.map(str::to_string),
                }
            }
            ProviderKind::Scraping => {
                let Some(external_user_id) = us.external_id else {
                    self.fail_connection(
                        activity_id,
                        us,
                        ConnectionStatus::Disconnected,
                        FailureReason::AuthenticationFailed,
                    )
                    .await?;
                    return Ok(());
                };
                FetchTriggerRequest::Scraping {
                    request_id: Uuid::new_v4(),
                    user_site_id: us.id,
                    activity_id,
                    external_user_id,
                    fetch_from: self.window_for(us, site),
                }
            }
        };

        if let Err(err) = self.gateway.trigger_fetch(&us.provider, request).await {
            self.fail_with_provider_error(activity_id, us, &err).await?;
            return Ok(());
        }

        counter!("refresh_fetch_triggered_total").increment(1);
        debug!(
            activity_id = %activity_id,
            user_site_id = %us.id,
            provider = %us.provider,
            "Fetch triggered"
        );

        // A retried connection sheds its old failure reason now
        if us.status != ConnectionStatus::Connected || us.failure_reason.is_some() {
            self.user_sites
                .update_status(us.id, ConnectionStatus::Connected, None, None)
                .await?;
        }

        Ok(())
    }

    /// Decrypts the stored access means, renewing them first when they are
    /// inside the renewal margin. `Ok(None)` means the connection has none.
    async fn resolve_access_means(
        &self,
        us: &user_site::Model,
        psu_ip_address: Option<&str>,
    ) -> Result<Option<String>, ResolveFailure> {
        let means = match self.user_sites.decrypt_access_means(us) {
            Ok(Some(means)) => means,
            Ok(None) => return Ok(None),
            Err(err) => {
                return Err(ResolveFailure::Provider(ProviderError::Technical(format!(
                    "stored access means unreadable: {err}"
                ))));
            }
        };

        let renewal_cutoff =
            self.clock.now() + Duration::minutes(MEANS_RENEWAL_MARGIN_MINUTES);
        let expires_soon = us
            .access_means_expires_at
            .map(|exp| exp.with_timezone(&Utc) <= renewal_cutoff)
            .unwrap_or(false);
        if !expires_soon {
            return Ok(Some(means));
        }

        debug!(user_site_id = %us.id, provider = %us.provider, "Renewing access means");
        let request = RenewMeansRequest {
            request_id: Uuid::new_v4(),
            user_site_id: us.id,
            access_means: means,
            psu_ip_address: psu_ip_address.map(str::to_string),
        };
        match self.gateway.renew_access_means(&us.provider, request).await {
            Ok(renewed) => {
                self.user_sites
                    .set_access_means(us.id, &renewed.blob, renewed.created_at, renewed.expires_at)
                    .await
                    .map_err(ResolveFailure::Unexpected)?;
                counter!("access_means_renewed_total").increment(1);
                Ok(Some(renewed.blob))
            }
            Err(err) => Err(ResolveFailure::Provider(err)),
        }
    }

    async fn fail_with_provider_error(
        &self,
        activity_id: Uuid,
        us: &user_site::Model,
        err: &ProviderError,
    ) -> anyhow::Result<()> {
        let status = match err.refresh_status(self.disconnect_on_consent_expired) {
            // "Stay connected" keeps whatever status the connection had
            ConnectionStatus::Connected => us.status.clone(),
            disconnected => disconnected,
        };
        warn!(
            activity_id = %activity_id,
            user_site_id = %us.id,
            provider = %us.provider,
            "Connection failed its refresh: {}",
            err
        );
        self.fail_connection(activity_id, us, status, err.failure_reason())
            .await
    }

    /// Marks, unlocks and reports one failed connection, in that order.
    async fn fail_connection(
        &self,
        activity_id: Uuid,
        us: &user_site::Model,
        status: ConnectionStatus,
        reason: FailureReason,
    ) -> anyhow::Result<()> {
        self.user_sites
            .update_status(us.id, status, Some(reason.clone()), None)
            .await?;
        self.locks.unlock(us.id).await?;
        counter!("refresh_connection_failed_total").increment(1);
        self.events
            .publish(SiteEvent::RefreshFailed {
                activity_id,
                user_site_id: us.id,
                reason,
            })
            .await;
        Ok(())
    }

    /// Best-effort catch-up: every connection the batch never got to is
    /// unlocked and marked so nothing stays locked with no outstanding work.
    /// Failures here are logged, never raised.
    async fn abandon(&self, activity_id: Uuid, remaining: &[user_site::Model]) {
        for us in remaining {
            let status = us.status.clone();
            if let Err(err) = self
                .fail_connection(activity_id, us, status, FailureReason::TechnicalError)
                .await
            {
                warn!(
                    activity_id = %activity_id,
                    user_site_id = %us.id,
                    "Catch-up cleanup failed: {:#}",
                    err
                );
            }
        }
    }

    fn window_for(&self, us: &user_site::Model, site: &site::Model) -> DateTime<Utc> {
        let inputs = WindowInputs {
            client_id: us.client_id.clone(),
            provider: us.provider.clone(),
            provider_kind: site.provider_kind.clone(),
            last_data_fetch: us.last_data_fetch.map(|t| t.with_timezone(&Utc)),
            access_means_created: us.access_means_created_at.map(|t| t.with_timezone(&Utc)),
            derived_lower_bound: None,
        };
        fetch_lower_bound(&self.window, self.clock.now(), &inputs)
    }
}

/// A connection joins scheduled batches unless it is mid-migration, waiting
/// on a user step, or failed in a way only the user can fix. A plain
/// technical failure keeps it eligible so the next pass retries it.
fn eligible_for_refresh(us: &user_site::Model) -> bool {
    !us.is_deleted
        && us.migration_status.is_none()
        && us.status != ConnectionStatus::StepNeeded
        && matches!(
            us.failure_reason,
            None | Some(FailureReason::TechnicalError)
        )
}
