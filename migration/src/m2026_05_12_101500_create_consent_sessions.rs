//! Migration to create the consent_sessions table.
//!
//! A consent session correlates an opaque state token with an in-progress
//! login/consent attempt: the pending step handed to the user, the step
//! counter, and the pre-flow status snapshot used for rollback.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConsentSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConsentSessions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConsentSessions::StateId).text().not_null())
                    .col(ColumnDef::new(ConsentSessions::UserId).uuid().not_null())
                    .col(ColumnDef::new(ConsentSessions::ClientId).text().not_null())
                    .col(ColumnDef::new(ConsentSessions::Operation).text().not_null())
                    .col(ColumnDef::new(ConsentSessions::SiteId).uuid().not_null())
                    .col(ColumnDef::new(ConsentSessions::UserSiteId).uuid().null())
                    .col(
                        ColumnDef::new(ConsentSessions::RedirectUrlId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSessions::ActivityId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSessions::StepNumber)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ConsentSessions::FormStep).json_binary().null())
                    .col(
                        ColumnDef::new(ConsentSessions::RedirectStep)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(ConsentSessions::ProviderState).text().null())
                    .col(ColumnDef::new(ConsentSessions::OriginalStatus).text().null())
                    .col(
                        ColumnDef::new(ConsentSessions::OriginalFailureReason)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(ConsentSessions::PsuIpAddress).text().null())
                    .col(
                        ColumnDef::new(ConsentSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ConsentSessions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_consent_sessions_user_site_id")
                            .from(ConsentSessions::Table, ConsentSessions::UserSiteId)
                            .to(UserSites::Table, UserSites::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // State tokens are single use; the lookup-and-rotate CAS keys on this
        manager
            .create_index(
                Index::create()
                    .name("idx_consent_sessions_state_id")
                    .table(ConsentSessions::Table)
                    .col(ConsentSessions::StateId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_consent_sessions_user_site_id")
                    .table(ConsentSessions::Table)
                    .col(ConsentSessions::UserSiteId)
                    .to_owned(),
            )
            .await?;

        // The cleanup sweeper scans by age
        manager
            .create_index(
                Index::create()
                    .name("idx_consent_sessions_created_at")
                    .table(ConsentSessions::Table)
                    .col(ConsentSessions::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_consent_sessions_state_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_consent_sessions_user_site_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_consent_sessions_created_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ConsentSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConsentSessions {
    Table,
    Id,
    StateId,
    UserId,
    ClientId,
    Operation,
    SiteId,
    UserSiteId,
    RedirectUrlId,
    ActivityId,
    StepNumber,
    FormStep,
    RedirectStep,
    ProviderState,
    OriginalStatus,
    OriginalFailureReason,
    PsuIpAddress,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum UserSites {
    Table,
    Id,
}
