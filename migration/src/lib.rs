//! Database migrations for the sitelink service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_05_11_090000_create_sites;
mod m2026_05_11_090100_create_user_sites;
mod m2026_05_11_090200_create_user_site_locks;
mod m2026_05_12_101500_create_consent_sessions;
mod m2026_06_18_113000_add_access_means_to_user_sites;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_05_11_090000_create_sites::Migration),
            Box::new(m2026_05_11_090100_create_user_sites::Migration),
            Box::new(m2026_05_11_090200_create_user_site_locks::Migration),
            Box::new(m2026_05_12_101500_create_consent_sessions::Migration),
            Box::new(m2026_06_18_113000_add_access_means_to_user_sites::Migration),
        ]
    }
}
