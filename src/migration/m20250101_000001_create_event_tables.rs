use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PageVisits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PageVisits::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PageVisits::SessionId).string().not_null())
                    .col(ColumnDef::new(PageVisits::PagePath).string().not_null())
                    .col(
                        ColumnDef::new(PageVisits::IsUnique)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(PageVisits::UserId).string())
                    .col(ColumnDef::new(PageVisits::IpAddress).string())
                    .col(ColumnDef::new(PageVisits::UserAgent).text())
                    .col(ColumnDef::new(PageVisits::VisitDate).date().not_null())
                    .col(
                        ColumnDef::new(PageVisits::CreatedAt)
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
                    .name("idx_page_visits_visit_date")
                    .table(PageVisits::Table)
                    .col(PageVisits::VisitDate)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ClearanceGenerations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ClearanceGenerations::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ClearanceGenerations::SessionId).string())
                    .col(ColumnDef::new(ClearanceGenerations::UserId).string())
                    .col(ColumnDef::new(ClearanceGenerations::DiscordUsername).string())
                    .col(ColumnDef::new(ClearanceGenerations::Callsign).string())
                    .col(ColumnDef::new(ClearanceGenerations::Destination).string())
                    .col(ColumnDef::new(ClearanceGenerations::Route).text())
                    .col(ColumnDef::new(ClearanceGenerations::RoutingType).string())
                    .col(ColumnDef::new(ClearanceGenerations::Runway).string())
                    .col(ColumnDef::new(ClearanceGenerations::InitialAltitude).integer())
                    .col(ColumnDef::new(ClearanceGenerations::Station).string())
                    .col(ColumnDef::new(ClearanceGenerations::AtisInfo).string())
                    .col(ColumnDef::new(ClearanceGenerations::ClearanceText).text())
                    .col(ColumnDef::new(ClearanceGenerations::IpAddress).string())
                    .col(ColumnDef::new(ClearanceGenerations::UserAgent).text())
                    .col(
                        ColumnDef::new(ClearanceGenerations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(FlightPlansReceived::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FlightPlansReceived::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FlightPlansReceived::Callsign).string())
                    .col(ColumnDef::new(FlightPlansReceived::Destination).string())
                    .col(ColumnDef::new(FlightPlansReceived::Route).text())
                    .col(ColumnDef::new(FlightPlansReceived::FlightLevel).string())
                    .col(ColumnDef::new(FlightPlansReceived::Source).string().not_null())
                    .col(ColumnDef::new(FlightPlansReceived::Raw).text().not_null())
                    .col(
                        ColumnDef::new(FlightPlansReceived::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserSessions::SessionId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UserSessions::UserId).string())
                    .col(ColumnDef::new(UserSessions::Username).string())
                    .col(
                        ColumnDef::new(UserSessions::PageViews)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserSessions::ClearancesGenerated)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(UserSessions::FirstSeen)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserSessions::LastActivity)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserSessions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(FlightPlansReceived::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ClearanceGenerations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PageVisits::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PageVisits {
    Table,
    Id,
    SessionId,
    PagePath,
    IsUnique,
    UserId,
    IpAddress,
    UserAgent,
    VisitDate,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ClearanceGenerations {
    Table,
    Id,
    SessionId,
    UserId,
    DiscordUsername,
    Callsign,
    Destination,
    Route,
    RoutingType,
    Runway,
    InitialAltitude,
    Station,
    AtisInfo,
    ClearanceText,
    IpAddress,
    UserAgent,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FlightPlansReceived {
    Table,
    Id,
    Callsign,
    Destination,
    Route,
    FlightLevel,
    Source,
    Raw,
    CreatedAt,
}

#[derive(DeriveIden)]
enum UserSessions {
    Table,
    SessionId,
    UserId,
    Username,
    PageViews,
    ClearancesGenerated,
    FirstSeen,
    LastActivity,
}
