//! Access to the optional relational datastore through Sea-ORM.
//!
//! [`Datastore`] implements the write seams used by the rest of the crate
//! ([`AnalyticsMirror`] and [`SettingsRepository`]) and the read queries the
//! admin and public endpoints need. Aggregate leaderboard queries are stored
//! procedures owned by the database and are called as opaque RPCs.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{
    sea_query::{Expr, Func, OnConflict},
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database,
    DatabaseConnection, DbErr, EntityTrait, FromQueryResult, JsonValue, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Select, Set, Statement,
};
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    analytics::{AnalyticsMirror, AnalyticsSeed, ClearanceRecord, PageVisit},
    auth::DiscordProfile,
    entity::{
        admin_settings::{self, SETTINGS_ROW_ID},
        analytics_reset, clearance_generation, discord_user, flight_plan_received, page_visit, user_session,
    },
    feed::FlightPlan,
    session::Session,
    settings::{AdminSettings, SettingsRepository},
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Tables the admin dashboard may browse. Anything else is rejected before a
/// query is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminTable {
    PageVisits,
    ClearanceGenerations,
    FlightPlansReceived,
    UserSessions,
    DiscordUsers,
}

impl AdminTable {
    pub const ALL: [AdminTable; 5] = [
        AdminTable::PageVisits,
        AdminTable::ClearanceGenerations,
        AdminTable::FlightPlansReceived,
        AdminTable::UserSessions,
        AdminTable::DiscordUsers,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AdminTable::PageVisits => "page_visits",
            AdminTable::ClearanceGenerations => "clearance_generations",
            AdminTable::FlightPlansReceived => "flight_plans_received",
            AdminTable::UserSessions => "user_sessions",
            AdminTable::DiscordUsers => "discord_users",
        }
    }
}

impl fmt::Display for AdminTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AdminTable {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        AdminTable::ALL
            .into_iter()
            .find(|table| table.name() == name)
            .ok_or_else(|| format!("unknown table {name}"))
    }
}

/// One page of rows from an [`AdminTable`], newest first.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePage {
    pub data: Vec<JsonValue>,
    pub total_count: u64,
}

#[derive(Debug, Clone)]
pub struct Datastore {
    conn: DatabaseConnection,
}

impl Datastore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let mut options = ConnectOptions::new(url.to_owned());
        options
            .max_connections(max_connections.max(1))
            .min_connections(1)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(10 * 60))
            .max_lifetime(Duration::from_secs(30 * 60))
            .sqlx_logging(false);

        Ok(Self::new(Database::connect(options).await?))
    }

    /// Applies any pending schema migrations.
    #[cfg(feature = "migration")]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        use sea_orm_migration::MigratorTrait;

        crate::migration::Migrator::up(&self.conn, None).await?;
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.conn.ping().await?;
        Ok(())
    }

    /// Per-day visit counts and event totals used to seed in-process counters.
    /// Events at or before the latest recorded reset are not counted.
    pub async fn analytics_seed(&self) -> Result<AnalyticsSeed, StoreError> {
        let last_reset = self.last_analytics_reset().await?;
        let since = last_reset.map(|at| at.fixed_offset());

        let mut visits = page_visit::Entity::find();
        let mut clearances = clearance_generation::Entity::find();
        let mut plans = flight_plan_received::Entity::find();
        if let Some(since) = since {
            visits = visits.filter(page_visit::Column::CreatedAt.gt(since));
            clearances = clearances.filter(clearance_generation::Column::CreatedAt.gt(since));
            plans = plans.filter(flight_plan_received::Column::CreatedAt.gt(since));
        }

        let per_day: Vec<(NaiveDate, i64)> = visits
            .select_only()
            .column(page_visit::Column::VisitDate)
            .column_as(page_visit::Column::Id.count(), "visits")
            .group_by(page_visit::Column::VisitDate)
            .into_tuple()
            .all(&self.conn)
            .await?;

        let clearances_generated = clearances.count(&self.conn).await?;
        let flight_plans_received = plans.count(&self.conn).await?;

        let daily_visits: BTreeMap<NaiveDate, u64> = per_day
            .into_iter()
            .map(|(day, visits)| (day, u64::try_from(visits).unwrap_or_default()))
            .collect();

        Ok(AnalyticsSeed {
            daily_visits,
            clearances_generated,
            flight_plans_received,
            last_reset,
        })
    }

    pub async fn last_analytics_reset(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest = analytics_reset::Entity::find()
            .order_by_desc(analytics_reset::Column::ResetAt)
            .one(&self.conn)
            .await?;
        Ok(latest.map(|row| row.reset_at.with_timezone(&Utc)))
    }

    /// A page of `table`, newest first, with the table's total row count.
    pub async fn table_page(
        &self,
        table: AdminTable,
        limit: u64,
        offset: u64,
    ) -> Result<TablePage, StoreError> {
        match table {
            AdminTable::PageVisits => {
                self.page_of(
                    page_visit::Entity::find().order_by_desc(page_visit::Column::CreatedAt),
                    limit,
                    offset,
                )
                .await
            }
            AdminTable::ClearanceGenerations => {
                self.page_of(
                    clearance_generation::Entity::find()
                        .order_by_desc(clearance_generation::Column::CreatedAt),
                    limit,
                    offset,
                )
                .await
            }
            AdminTable::FlightPlansReceived => {
                self.page_of(
                    flight_plan_received::Entity::find()
                        .order_by_desc(flight_plan_received::Column::CreatedAt),
                    limit,
                    offset,
                )
                .await
            }
            AdminTable::UserSessions => {
                self.page_of(
                    user_session::Entity::find()
                        .order_by_desc(user_session::Column::LastActivity),
                    limit,
                    offset,
                )
                .await
            }
            AdminTable::DiscordUsers => {
                self.page_of(
                    discord_user::Entity::find().order_by_desc(discord_user::Column::CreatedAt),
                    limit,
                    offset,
                )
                .await
            }
        }
    }

    async fn page_of<E>(
        &self,
        select: Select<E>,
        limit: u64,
        offset: u64,
    ) -> Result<TablePage, StoreError>
    where
        E: EntityTrait,
        E::Model: Sync,
    {
        let total_count = select.clone().count(&self.conn).await?;
        let data = select
            .offset(offset)
            .limit(limit)
            .into_json()
            .all(&self.conn)
            .await?;
        Ok(TablePage { data, total_count })
    }

    /// Rows in `user_sessions`.
    pub async fn stored_session_count(&self) -> Result<u64, StoreError> {
        Ok(user_session::Entity::find().count(&self.conn).await?)
    }

    /// Most recently received flight plans, newest first.
    pub async fn recent_flight_plans(&self, limit: u64) -> Result<Vec<JsonValue>, StoreError> {
        let rows = flight_plan_received::Entity::find()
            .order_by_desc(flight_plan_received::Column::Id)
            .limit(limit)
            .all(&self.conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                serde_json::from_str(&row.raw).unwrap_or_else(|_| {
                    json!({
                        "callsign": row.callsign,
                        "arriving": row.destination,
                        "route": row.route,
                        "flightlevel": row.flight_level,
                        "source": row.source,
                        "timestamp": row.created_at,
                    })
                })
            })
            .collect())
    }

    pub async fn leaderboard(&self) -> Result<Vec<JsonValue>, StoreError> {
        let statement = Statement::from_string(
            self.conn.get_database_backend(),
            "SELECT * FROM get_clearance_leaderboard()",
        );
        Ok(JsonValue::find_by_statement(statement)
            .all(&self.conn)
            .await?)
    }

    pub async fn user_clearances(&self, user_id: &str) -> Result<Vec<JsonValue>, StoreError> {
        let statement = Statement::from_sql_and_values(
            self.conn.get_database_backend(),
            "SELECT * FROM get_user_clearances($1)",
            [user_id.into()],
        );
        Ok(JsonValue::find_by_statement(statement)
            .all(&self.conn)
            .await?)
    }

    /// Inserts or refreshes a Discord account. `is_admin` and `roles` are
    /// left untouched for existing accounts.
    pub async fn upsert_discord_user(
        &self,
        profile: &DiscordProfile,
        now: DateTime<Utc>,
    ) -> Result<discord_user::Model, StoreError> {
        let now = now.fixed_offset();
        let model = discord_user::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            discord_id: Set(profile.id.clone()),
            username: Set(profile.username.clone()),
            email: Set(profile.email.clone()),
            avatar: Set(profile.avatar_url()),
            is_admin: Set(false),
            roles: Set("[]".to_string()),
            last_login: Set(now),
            created_at: Set(now),
        };

        discord_user::Entity::insert(model)
            .on_conflict(
                OnConflict::column(discord_user::Column::DiscordId)
                    .update_columns([
                        discord_user::Column::Username,
                        discord_user::Column::Email,
                        discord_user::Column::Avatar,
                        discord_user::Column::LastLogin,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;

        discord_user::Entity::find()
            .filter(discord_user::Column::DiscordId.eq(profile.id.as_str()))
            .one(&self.conn)
            .await?
            .ok_or_else(|| {
                DbErr::RecordNotFound(format!("discord user {} after upsert", profile.id)).into()
            })
    }

    pub async fn find_user(&self, id: &str) -> Result<Option<discord_user::Model>, StoreError> {
        Ok(discord_user::Entity::find_by_id(id.to_owned())
            .one(&self.conn)
            .await?)
    }

    pub async fn admin_users(&self) -> Result<Vec<discord_user::Model>, StoreError> {
        Ok(discord_user::Entity::find()
            .filter(discord_user::Column::IsAdmin.eq(true))
            .order_by_asc(discord_user::Column::Username)
            .all(&self.conn)
            .await?)
    }

    /// Grants admin to the account with `username` (case-insensitive),
    /// adding `roles` to the ones it already has.
    pub async fn grant_admin(
        &self,
        username: &str,
        roles: &[String],
    ) -> Result<Option<discord_user::Model>, StoreError> {
        let found = discord_user::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col(discord_user::Column::Username)))
                    .eq(username.to_lowercase()),
            )
            .one(&self.conn)
            .await?;

        let Some(user) = found else {
            return Ok(None);
        };

        let mut merged = user.role_list();
        merged.extend(roles.iter().cloned());
        merged.sort();
        merged.dedup();

        self.set_admin(user, true, &merged).await.map(Some)
    }

    pub async fn revoke_admin(&self, id: &str) -> Result<Option<discord_user::Model>, StoreError> {
        match self.find_user(id).await? {
            Some(user) => self.set_admin(user, false, &[]).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_admin(
        &self,
        user: discord_user::Model,
        is_admin: bool,
        roles: &[String],
    ) -> Result<discord_user::Model, StoreError> {
        let roles = serde_json::to_string(roles)?;
        let mut active: discord_user::ActiveModel = user.into();
        active.is_admin = Set(is_admin);
        active.roles = Set(roles);
        Ok(active.update(&self.conn).await?)
    }
}

#[async_trait]
impl AnalyticsMirror for Datastore {
    async fn page_visit(&self, visit: &PageVisit) -> Result<(), StoreError> {
        page_visit::ActiveModel {
            session_id: Set(visit.session_id.to_string()),
            page_path: Set(visit.path.clone()),
            is_unique: Set(visit.first_view),
            user_id: Set(visit.meta.user_id.clone()),
            ip_address: Set(visit.meta.ip_address.clone()),
            user_agent: Set(visit.meta.user_agent.clone()),
            visit_date: Set(visit.visited_at.date_naive()),
            created_at: Set(visit.visited_at.fixed_offset()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }

    async fn clearance(&self, record: &ClearanceRecord) -> Result<(), StoreError> {
        let fields = &record.fields;
        clearance_generation::ActiveModel {
            session_id: Set(Some(record.session_id.to_string())),
            user_id: Set(record.meta.user_id.clone().or_else(|| fields.user_id.clone())),
            discord_username: Set(record
                .meta
                .username
                .clone()
                .or_else(|| fields.discord_username.clone())),
            callsign: Set(fields.callsign.clone()),
            destination: Set(fields.destination.clone()),
            route: Set(fields.route.clone()),
            routing_type: Set(fields.routing_type.clone()),
            runway: Set(fields.runway.clone()),
            initial_altitude: Set(fields.initial_altitude),
            station: Set(fields.station.clone()),
            atis_info: Set(fields.atis_info.clone()),
            clearance_text: Set(fields.clearance_text.clone()),
            ip_address: Set(record.meta.ip_address.clone()),
            user_agent: Set(record.meta.user_agent.clone()),
            created_at: Set(record.generated_at.fixed_offset()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }

    async fn flight_plan(&self, plan: &FlightPlan) -> Result<(), StoreError> {
        flight_plan_received::ActiveModel {
            callsign: Set(plan.callsign.clone()),
            destination: Set(plan.arriving.clone()),
            route: Set(plan.route.clone()),
            flight_level: Set(plan.flightlevel.clone()),
            source: Set(plan.source.to_string()),
            raw: Set(serde_json::to_string(plan)?),
            created_at: Set(plan.timestamp.fixed_offset()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }

    async fn session(&self, session: &Session) -> Result<(), StoreError> {
        let model = user_session::ActiveModel {
            session_id: Set(session.id.to_string()),
            user_id: Set(session.user_id.clone()),
            username: Set(session.username.clone()),
            page_views: Set(saturating_i64(session.page_views)),
            clearances_generated: Set(saturating_i64(session.clearances_generated)),
            first_seen: Set(session.created_at.fixed_offset()),
            last_activity: Set(session.last_activity.fixed_offset()),
        };

        user_session::Entity::insert(model)
            .on_conflict(
                OnConflict::column(user_session::Column::SessionId)
                    .update_columns([
                        user_session::Column::UserId,
                        user_session::Column::Username,
                        user_session::Column::PageViews,
                        user_session::Column::ClearancesGenerated,
                        user_session::Column::LastActivity,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }

    async fn reset(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        analytics_reset::ActiveModel {
            reset_at: Set(at.fixed_offset()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for Datastore {
    async fn load_settings(&self) -> Result<Option<JsonValue>, StoreError> {
        let row = admin_settings::Entity::find_by_id(SETTINGS_ROW_ID)
            .one(&self.conn)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.settings)?)),
            None => {
                debug!("No stored settings row");
                Ok(None)
            }
        }
    }

    async fn save_settings(&self, settings: &AdminSettings) -> Result<(), StoreError> {
        let model = admin_settings::ActiveModel {
            id: Set(SETTINGS_ROW_ID),
            settings: Set(serde_json::to_string(settings)?),
            updated_at: Set(Utc::now().fixed_offset()),
        };

        admin_settings::Entity::insert(model)
            .on_conflict(
                OnConflict::column(admin_settings::Column::Id)
                    .update_columns([
                        admin_settings::Column::Settings,
                        admin_settings::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;
        Ok(())
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
