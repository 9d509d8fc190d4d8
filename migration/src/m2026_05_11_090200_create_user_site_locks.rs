//! Migration to create the user_site_locks table.
//!
//! One row per user_site carries the TTL lock that serializes mutating
//! operations on the connection. Unlocking nulls the fields in place; the row
//! itself stays so the conditional upsert always has a stable target.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UserSiteLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserSiteLocks::UserSiteId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UserSiteLocks::ActivityId).uuid().null())
                    .col(
                        ColumnDef::new(UserSiteLocks::LockedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSiteLocks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserSiteLocks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_site_locks_user_site_id")
                            .from(UserSiteLocks::Table, UserSiteLocks::UserSiteId)
                            .to(UserSites::Table, UserSites::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserSiteLocks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UserSiteLocks {
    Table,
    UserSiteId,
    ActivityId,
    LockedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum UserSites {
    Table,
    Id,
}
