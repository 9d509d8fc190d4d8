//! Flywheel refresh loop
//!
//! Background task that periodically scans for connections whose data has
//! gone stale and dispatches detached refresh batches for them, one batch
//! per user. Keeps data fresh without anybody asking.

use std::collections::BTreeMap;

use chrono::Duration;
use metrics::{counter, gauge, histogram};
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::FlywheelConfig;
use crate::models::{ActionType, user_site};
use crate::repositories::UserSiteRepository;

use super::orchestrator::RefreshService;

pub struct FlywheelService {
    config: FlywheelConfig,
    user_sites: UserSiteRepository,
    refresh: RefreshService,
    clock: SharedClock,
}

#[derive(Debug, Default)]
struct FlywheelTickStats {
    candidates: u64,
    users: u64,
    dispatched: u64,
}

impl FlywheelService {
    pub fn new(
        config: FlywheelConfig,
        user_sites: UserSiteRepository,
        refresh: RefreshService,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            user_sites,
            refresh,
            clock,
        }
    }

    /// Run the flywheel loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            tick_seconds = self.config.tick_seconds,
            fetch_interval_hours = self.config.fetch_interval_hours,
            "Starting flywheel refresh service"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Flywheel refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Flywheel tick failed");
                    }
                    let elapsed = tick_started.elapsed();
                    histogram!("flywheel_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Flywheel refresh service stopped");
        Ok(())
    }

    /// Execute one tick: find stale connections and dispatch a detached
    /// refresh batch per user. Dispatch is fire-and-forget; the batches
    /// run out their locks on the runtime while the loop sleeps on.
    #[instrument(skip_all)]
    async fn tick(&self) -> anyhow::Result<()> {
        let due_before = self.clock.now() - Duration::hours(self.config.fetch_interval_hours);
        let candidates = self
            .user_sites
            .find_refresh_candidates(due_before, self.config.batch_limit)
            .await?;

        let mut stats = FlywheelTickStats {
            candidates: candidates.len() as u64,
            ..Default::default()
        };

        let by_user = group_by_user(candidates);
        stats.users = by_user.len() as u64;

        for (user_id, group) in by_user {
            debug!(
                user_id = %user_id,
                connections = group.len(),
                "Dispatching flywheel refresh"
            );
            stats.dispatched += group.len() as u64;
            self.refresh
                .refresh_detached(group, false, ActionType::FlywheelRefresh, None, None);
        }

        gauge!("flywheel_candidates_gauge").set(stats.candidates as f64);
        counter!("flywheel_refreshes_dispatched_total").increment(stats.dispatched);

        debug!(
            candidates = stats.candidates,
            users = stats.users,
            dispatched = stats.dispatched,
            "Flywheel tick completed"
        );

        Ok(())
    }
}

fn group_by_user(candidates: Vec<user_site::Model>) -> BTreeMap<Uuid, Vec<user_site::Model>> {
    let mut by_user: BTreeMap<Uuid, Vec<user_site::Model>> = BTreeMap::new();
    for us in candidates {
        by_user.entry(us.user_id).or_default().push(us);
    }
    by_user
}
