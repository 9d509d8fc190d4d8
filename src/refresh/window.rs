//! Retrieval window calculator
//!
//! Computes the lower-bound timestamp a data fetch asks the bank for. Pure:
//! callers pass `now` and everything known about the connection, policy comes
//! in through [`FetchWindowConfig`]. The result always lands inside
//! `[now - max_history, now - min_recency]` whatever the inputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::site::ProviderKind;

/// Fixed overlap re-requested on incremental fetches, matching the overlap
/// scraping providers apply on their side.
pub const FETCH_OVERLAP_DAYS: i64 = 40;

/// Window policy: global defaults plus per-client and per-provider overrides.
///
/// Some banks settle duplicate transactions slowly; their providers get a
/// larger `min_recency` so we stop re-querying the settling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchWindowConfig {
    /// How far back a first fetch may reach, in months
    pub max_history_months: u32,
    /// How close to `now` the lower bound may get, in days
    pub min_recency_days: i64,
    pub client_max_history_months: BTreeMap<String, u32>,
    pub client_min_recency_days: BTreeMap<String, i64>,
    pub provider_min_recency_days: BTreeMap<String, i64>,
}

impl Default for FetchWindowConfig {
    fn default() -> Self {
        Self {
            max_history_months: 18,
            min_recency_days: 21,
            client_max_history_months: BTreeMap::new(),
            client_min_recency_days: BTreeMap::new(),
            provider_min_recency_days: BTreeMap::new(),
        }
    }
}

impl FetchWindowConfig {
    pub fn max_history_for(&self, client_id: &str) -> u32 {
        self.client_max_history_months
            .get(client_id)
            .copied()
            .unwrap_or(self.max_history_months)
    }

    /// Provider overrides beat client overrides beat the default.
    pub fn min_recency_for(&self, client_id: &str, provider: &str) -> i64 {
        if let Some(days) = self.provider_min_recency_days.get(provider) {
            return *days;
        }
        self.client_min_recency_days
            .get(client_id)
            .copied()
            .unwrap_or(self.min_recency_days)
    }
}

/// Everything known about the connection that feeds the window decision.
#[derive(Debug, Clone)]
pub struct WindowInputs {
    pub client_id: String,
    pub provider: String,
    pub provider_kind: ProviderKind,
    pub last_data_fetch: Option<DateTime<Utc>>,
    pub access_means_created: Option<DateTime<Utc>>,
    /// Lower bound derived externally from already-ingested transactions
    pub derived_lower_bound: Option<DateTime<Utc>>,
}

/// Lower-bound timestamp for the next fetch.
///
/// Decision order: a direct-connection fetch with no usable prior fetch, or
/// whose access means were recreated after the last fetch, starts over from
/// the maximum-history floor. Otherwise a derived bound wins, then the last
/// fetch minus the fixed overlap. A fetch timestamp equal to the Unix epoch
/// is a legacy "never fetched" sentinel and is ignored.
pub fn fetch_lower_bound(
    config: &FetchWindowConfig,
    now: DateTime<Utc>,
    inputs: &WindowInputs,
) -> DateTime<Utc> {
    let floor = now - Months::new(config.max_history_for(&inputs.client_id));
    let ceiling = now - Duration::days(config.min_recency_for(&inputs.client_id, &inputs.provider));
    let ceiling = ceiling.max(floor);

    let last_fetch = inputs.last_data_fetch.filter(|t| t.timestamp() != 0);
    let means_renewed = match (inputs.access_means_created, last_fetch) {
        (Some(created), Some(fetched)) => created > fetched,
        _ => false,
    };

    let raw = if inputs.provider_kind == ProviderKind::DirectConnection
        && (last_fetch.is_none() || means_renewed)
    {
        floor
    } else if let Some(derived) = inputs.derived_lower_bound {
        derived
    } else if let Some(fetched) = last_fetch {
        fetched - Duration::days(FETCH_OVERLAP_DAYS)
    } else {
        warn!(
            client_id = %inputs.client_id,
            provider = %inputs.provider,
            "No usable fetch history for window computation, using the maximum-history floor"
        );
        floor
    };

    raw.clamp(floor, ceiling)
}
