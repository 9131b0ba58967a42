use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AdminSettings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AdminSettings::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AdminSettings::Settings).text().not_null())
                    .col(
                        ColumnDef::new(AdminSettings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DiscordUsers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DiscordUsers::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DiscordUsers::DiscordId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(DiscordUsers::Username).string().not_null())
                    .col(ColumnDef::new(DiscordUsers::Email).string())
                    .col(ColumnDef::new(DiscordUsers::Avatar).string())
                    .col(
                        ColumnDef::new(DiscordUsers::IsAdmin)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(DiscordUsers::Roles)
                            .text()
                            .not_null()
                            .default("[]"),
                    )
                    .col(
                        ColumnDef::new(DiscordUsers::LastLogin)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DiscordUsers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LoginSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LoginSessions::Id)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LoginSessions::Data).blob().not_null())
                    .col(
                        ColumnDef::new(LoginSessions::ExpiryDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_login_sessions_expiry_date")
                    .table(LoginSessions::Table)
                    .col(LoginSessions::ExpiryDate)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LoginSessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DiscordUsers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AdminSettings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AdminSettings {
    Table,
    Id,
    Settings,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DiscordUsers {
    Table,
    Id,
    DiscordId,
    Username,
    Email,
    Avatar,
    IsAdmin,
    Roles,
    LastLogin,
    CreatedAt,
}

#[derive(DeriveIden)]
enum LoginSessions {
    Table,
    Id,
    Data,
    ExpiryDate,
}
