//! Consent session cleanup
//!
//! Background task that sweeps consent sessions whose user never came back.
//! A swept session's connection, when it is still parked in STEP_NEEDED,
//! rolls back to its pre-flow snapshot or to disconnected with an
//! authentication failure, and any lock the session's activity still held is
//! released. The session row itself is deleted either way.

use chrono::Duration;
use metrics::{counter, histogram};
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::clock::SharedClock;
use crate::config::CleanupConfig;
use crate::consent::processor::rollback_target;
use crate::events::{SharedEventPublisher, SiteEvent};
use crate::models::consent_session;
use crate::models::user_site::ConnectionStatus;
use crate::repositories::{ConsentSessionRepository, UserSiteLockRepository, UserSiteRepository};

pub struct SessionCleanupService {
    config: CleanupConfig,
    sessions: ConsentSessionRepository,
    user_sites: UserSiteRepository,
    locks: UserSiteLockRepository,
    events: SharedEventPublisher,
    clock: SharedClock,
}

#[derive(Debug, Default)]
struct CleanupTickStats {
    expired: u64,
    swept: u64,
    rolled_back: u64,
}

impl SessionCleanupService {
    pub fn new(
        config: CleanupConfig,
        sessions: ConsentSessionRepository,
        user_sites: UserSiteRepository,
        locks: UserSiteLockRepository,
        events: SharedEventPublisher,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            sessions,
            user_sites,
            locks,
            events,
            clock,
        }
    }

    /// Run the cleanup loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            tick_seconds = self.config.tick_seconds,
            session_ttl_minutes = self.config.session_ttl_minutes,
            "Starting consent session cleanup service"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Consent session cleanup shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Consent session cleanup tick failed");
                    }
                    let elapsed = tick_started.elapsed();
                    histogram!("consent_cleanup_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Consent session cleanup service stopped");
        Ok(())
    }

    /// Execute one tick: sweep every session older than the TTL. A session
    /// that fails to sweep stays behind and is retried on the next tick.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> anyhow::Result<()> {
        let cutoff = self.clock.now() - Duration::minutes(self.config.session_ttl_minutes);
        let expired = self
            .sessions
            .find_older_than(cutoff, self.config.batch_limit)
            .await?;

        let mut stats = CleanupTickStats {
            expired: expired.len() as u64,
            ..Default::default()
        };

        for session in expired {
            match self.sweep(&session).await {
                Ok(rolled_back) => {
                    stats.swept += 1;
                    if rolled_back {
                        stats.rolled_back += 1;
                    }
                }
                Err(err) => {
                    error!(
                        session_id = %session.id,
                        error = ?err,
                        "Failed to sweep expired consent session"
                    );
                }
            }
        }

        if stats.swept > 0 {
            counter!("consent_sessions_swept_total").increment(stats.swept);
            info!(
                expired = stats.expired,
                swept = stats.swept,
                rolled_back = stats.rolled_back,
                "Swept expired consent sessions"
            );
        }

        Ok(())
    }

    /// Sweep one expired session. Returns whether a connection was rolled
    /// back alongside it.
    async fn sweep(&self, session: &consent_session::Model) -> anyhow::Result<bool> {
        let mut rolled_back = false;

        if let Some(user_site_id) = session.user_site_id {
            let user_site = self
                .user_sites
                .get(user_site_id)
                .await?
                .filter(|us| !us.is_deleted);

            if let Some(us) = user_site {
                // Only a connection still waiting on the dead flow rolls
                // back; any other status means the flow already terminated
                if us.status == ConnectionStatus::StepNeeded {
                    let (status, reason) = rollback_target(session);
                    self.user_sites
                        .update_status(us.id, status.clone(), reason.clone(), None)
                        .await?;
                    self.events
                        .publish(SiteEvent::ConnectionStatusChanged {
                            user_site_id: us.id,
                            status,
                            failure_reason: reason,
                        })
                        .await;
                    rolled_back = true;
                }

                // Release the lock only when this session's activity holds it
                if self.locks.holder(us.id).await? == Some(session.activity_id) {
                    self.locks.unlock(us.id).await?;
                }
            }
        }

        self.sessions.delete(session.id).await?;
        debug!(
            session_id = %session.id,
            step_number = session.step_number,
            "Swept expired consent session"
        );

        Ok(rolled_back)
    }
}
