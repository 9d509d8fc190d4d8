//! Site entity model
//!
//! This module contains the SeaORM entity model for the sites table, the
//! registry of connectable banks and the provider that serves each of them.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Site entity representing one connectable bank.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sites")]
pub struct Model {
    /// Unique identifier for the site (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Human-readable bank name
    pub name: String,

    /// Provider key of the downstream integration serving this site
    pub provider: String,

    /// Integration style of the provider
    pub provider_kind: ProviderKind,

    /// Timestamp when the site was registered
    pub created_at: DateTimeWithTimeZone,
}

/// How a provider integrates with the bank. The two kinds branch through the
/// whole login and refresh machinery, so this is a closed set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum ProviderKind {
    /// PSD2-style API integration: redirect or form consent, access means,
    /// explicit fetch triggers.
    #[sea_orm(string_value = "DIRECT_CONNECTION")]
    #[serde(rename = "DIRECT_CONNECTION")]
    DirectConnection,

    /// Credential-based scraping integration: form logins, MFA steps,
    /// create-and-fetch in one provider-side operation.
    #[sea_orm(string_value = "SCRAPING")]
    #[serde(rename = "SCRAPING")]
    Scraping,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
