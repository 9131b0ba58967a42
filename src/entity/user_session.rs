use sea_orm::entity::prelude::*;

/// Aggregate of a tracking session, upserted whenever its counters change.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "user_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub session_id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub page_views: i64,
    pub clearances_generated: i64,
    pub first_seen: DateTimeWithTimeZone,
    pub last_activity: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
