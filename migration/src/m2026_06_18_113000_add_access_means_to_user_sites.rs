//! Adds encrypted access-means storage to user_sites.
//!
//! Direct-connection providers hand back an opaque credential blob after the
//! consent exchange; it is held encrypted at rest next to its validity window
//! so the refresh pass can renew it before it lapses.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(UserSites::Table)
                    .add_column(
                        ColumnDef::new(UserSites::AccessMeansCiphertext)
                            .binary()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSites::Table)
                    .add_column(
                        ColumnDef::new(UserSites::AccessMeansCreatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSites::Table)
                    .add_column(
                        ColumnDef::new(UserSites::AccessMeansExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Renewal pass scans for means about to lapse
        manager
            .create_index(
                Index::create()
                    .name("idx_user_sites_access_means_expires_at")
                    .table(UserSites::Table)
                    .col(UserSites::AccessMeansExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_user_sites_access_means_expires_at")
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSites::Table)
                    .drop_column(UserSites::AccessMeansCiphertext)
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSites::Table)
                    .drop_column(UserSites::AccessMeansCreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSites::Table)
                    .drop_column(UserSites::AccessMeansExpiresAt)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum UserSites {
    Table,
    AccessMeansCiphertext,
    AccessMeansCreatedAt,
    AccessMeansExpiresAt,
}
