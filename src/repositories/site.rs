//! Site repository for database operations
//!
//! Read-mostly access to the registry of connectable banks. Rows are seeded
//! at startup and looked up on every flow initiation.

use anyhow::{Result, anyhow};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::site::{self, Entity as Site};

/// Repository for site database operations
#[derive(Debug, Clone)]
pub struct SiteRepository {
    db: Arc<DatabaseConnection>,
}

impl SiteRepository {
    /// Creates a new SiteRepository instance
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds a site by its ID
    pub async fn get(&self, id: Uuid) -> Result<Option<site::Model>> {
        Ok(Site::find_by_id(id).one(&*self.db).await?)
    }

    /// Finds a site by its ID, erroring when it does not exist
    pub async fn require(&self, id: Uuid) -> Result<site::Model> {
        self.get(id)
            .await?
            .ok_or_else(|| anyhow!("site '{}' is not registered", id))
    }

    /// Finds a site by its unique name
    pub async fn find_by_name(&self, name: &str) -> Result<Option<site::Model>> {
        Ok(Site::find()
            .filter(site::Column::Name.eq(name))
            .one(&*self.db)
            .await?)
    }

    /// Lists all registered sites ordered by name
    pub async fn list(&self) -> Result<Vec<site::Model>> {
        Ok(Site::find()
            .order_by_asc(site::Column::Name)
            .all(&*self.db)
            .await?)
    }

    /// Creates a new site record
    pub async fn create(&self, site: site::ActiveModel) -> Result<site::Model> {
        let id = site
            .id
            .clone()
            .take()
            .ok_or_else(|| anyhow!("site id must be set"))?;

        site.insert(&*self.db).await?;

        let fetched = Site::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("site not persisted"))
    }
}
