//! Migration to create the user_sites table.
//!
//! A user_site row is one consented connection between an end-user and a bank
//! site. Status, failure reason and the soft-delete markers live here; the
//! concurrency lock is a separate table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserSites::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserSites::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UserSites::UserId).uuid().not_null())
                    .col(ColumnDef::new(UserSites::ClientId).text().not_null())
                    .col(ColumnDef::new(UserSites::SiteId).uuid().not_null())
                    .col(ColumnDef::new(UserSites::Provider).text().not_null())
                    .col(ColumnDef::new(UserSites::ExternalId).uuid().null())
                    .col(
                        ColumnDef::new(UserSites::Status)
                            .text()
                            .not_null()
                            .default("DISCONNECTED"),
                    )
                    .col(ColumnDef::new(UserSites::FailureReason).text().null())
                    .col(
                        ColumnDef::new(UserSites::StatusTimeoutAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSites::LastDataFetch)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(UserSites::RedirectUrlId).uuid().not_null())
                    .col(
                        ColumnDef::new(UserSites::PersistedFormAnswers)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(UserSites::MigrationStatus).text().null())
                    .col(
                        ColumnDef::new(UserSites::IsDeleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(UserSites::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSites::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserSites::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_sites_site_id")
                            .from(UserSites::Table, UserSites::SiteId)
                            .to(Sites::Table, Sites::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Per-user listing is the hottest read path
        manager
            .create_index(
                Index::create()
                    .name("idx_user_sites_user_id")
                    .table(UserSites::Table)
                    .col(UserSites::UserId)
                    .to_owned(),
            )
            .await?;

        // Eligibility scans filter on deletion marker and status
        manager
            .create_index(
                Index::create()
                    .name("idx_user_sites_deleted_status")
                    .table(UserSites::Table)
                    .col(UserSites::IsDeleted)
                    .col(UserSites::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_user_sites_user_id").to_owned())
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_user_sites_deleted_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(UserSites::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserSites {
    Table,
    Id,
    UserId,
    ClientId,
    SiteId,
    Provider,
    ExternalId,
    Status,
    FailureReason,
    StatusTimeoutAt,
    LastDataFetch,
    RedirectUrlId,
    PersistedFormAnswers,
    MigrationStatus,
    IsDeleted,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Sites {
    Table,
    Id,
}
