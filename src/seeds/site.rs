//! Site seeding functionality
//!
//! Seeds the site registry with the connectable banks a fresh deployment
//! starts with. Lookup is by name; existing rows are left untouched, so
//! restarting the service never rewrites the registry.

use anyhow::Result;
use chrono::Utc;
use sea_orm::{DatabaseConnection, Set};
use std::sync::Arc;
use uuid::{Uuid, uuid};

use crate::models::site::{self, ProviderKind};
use crate::repositories::SiteRepository;

/// Seed definition for one connectable bank
struct SiteSeed {
    id: Uuid,
    name: &'static str,
    provider: &'static str,
    kind: ProviderKind,
}

/// Fixed ids keep environments and client configuration in agreement.
const SITE_SEEDS: &[SiteSeed] = &[
    SiteSeed {
        id: uuid!("6e2f3c52-8a9d-4b71-9c0e-5f4d8a1b2c3d"),
        name: "Sandbox Direct Bank",
        provider: "sandbox_direct",
        kind: ProviderKind::DirectConnection,
    },
    SiteSeed {
        id: uuid!("90b1f2e3-4a5c-4d7e-8f90-a1b2c3d4e5f6"),
        name: "Sandbox Scraping Bank",
        provider: "sandbox_scraping",
        kind: ProviderKind::Scraping,
    },
];

/// Seeds the sites table with the sandbox banks
///
/// Checks whether each seed site already exists and creates it when it does
/// not, so the function is safe to run on every startup.
pub async fn seed_sites(db: &DatabaseConnection) -> Result<()> {
    let repo = SiteRepository::new(Arc::new(db.clone()));

    for seed in SITE_SEEDS {
        match repo.find_by_name(seed.name).await {
            Ok(Some(_)) => {
                log::info!("Site '{}' already exists, skipping", seed.name);
                continue;
            }
            Ok(None) => {
                log::info!("Creating site: {}", seed.name);

                let site = site::ActiveModel {
                    id: Set(seed.id),
                    name: Set(seed.name.to_string()),
                    provider: Set(seed.provider.to_string()),
                    provider_kind: Set(seed.kind),
                    created_at: Set(Utc::now().into()),
                };

                if let Err(e) = repo.create(site).await {
                    log::error!("Failed to create site '{}': {}", seed.name, e);
                    return Err(e);
                }
            }
            Err(e) => {
                log::error!("Error checking if site '{}' exists: {}", seed.name, e);
                return Err(e);
            }
        }
    }

    log::info!("Site seeding completed successfully");
    Ok(())
}
