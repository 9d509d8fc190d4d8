//! Hard-deletes soft-deleted bank connections together with their lock rows
//! and any consent sessions still pointing at them. The API only ever
//! soft-deletes; this binary is the scheduled reclamation behind it.

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use sitelink::{
    clock,
    config::ConfigLoader,
    crypto::CryptoKey,
    db,
    repositories::{ConsentSessionRepository, UserSiteLockRepository, UserSiteRepository},
};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "purge_user_sites",
    about = "Hard-delete soft-deleted bank connections past their retention window"
)]
struct Args {
    /// Report what would be purged without deleting anything
    #[arg(long)]
    dry_run: bool,

    /// Days a soft-deleted connection is retained before it may be purged
    #[arg(long, default_value_t = 30)]
    retention_days: i64,

    /// Upper bound on connections purged in one run
    #[arg(long, default_value_t = 500)]
    limit: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new();
    let config = loader.load().context("loading configuration")?;

    let key_bytes = config
        .crypto_key
        .clone()
        .context("crypto key not present in configuration")?;
    let crypto_key = CryptoKey::new(key_bytes).context("initializing crypto key")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    let db = Arc::new(db);
    let clock = clock::system_clock();

    let user_sites = UserSiteRepository::new(Arc::clone(&db), crypto_key, Arc::clone(&clock));
    let locks = UserSiteLockRepository::new(
        Arc::clone(&db),
        Arc::clone(&clock),
        Duration::minutes(config.lock_ttl_minutes),
    );
    let sessions = ConsentSessionRepository::new(Arc::clone(&db), Arc::clone(&clock));

    let cutoff = clock.now() - Duration::days(args.retention_days);
    let purgeable = user_sites
        .find_purgeable(cutoff, args.limit)
        .await
        .context("querying purgeable connections")?;

    if args.dry_run {
        for user_site in &purgeable {
            println!(
                "would purge {} (site {}, deleted at {})",
                user_site.id,
                user_site.site_id,
                user_site
                    .deleted_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
        println!("{} connection(s) would be purged.", purgeable.len());
        return Ok(());
    }

    let mut purged = 0usize;
    for user_site in purgeable {
        let sessions_removed = sessions
            .delete_for_user_site(user_site.id)
            .await
            .with_context(|| format!("removing consent sessions of {}", user_site.id))?;
        locks
            .hard_delete(user_site.id)
            .await
            .with_context(|| format!("removing lock row of {}", user_site.id))?;
        let removed = user_sites
            .hard_delete(user_site.id)
            .await
            .with_context(|| format!("removing connection {}", user_site.id))?;

        if removed {
            purged += 1;
            if sessions_removed > 0 {
                println!(
                    "purged {} with {} dangling consent session(s)",
                    user_site.id, sessions_removed
                );
            }
        }
    }

    println!("Purged {} soft-deleted connection(s).", purged);
    Ok(())
}
