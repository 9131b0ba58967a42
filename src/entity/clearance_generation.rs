use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "clearance_generations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub discord_username: Option<String>,
    pub callsign: Option<String>,
    pub destination: Option<String>,
    pub route: Option<String>,
    pub routing_type: Option<String>,
    pub runway: Option<String>,
    pub initial_altitude: Option<i32>,
    pub station: Option<String>,
    pub atis_info: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub clearance_text: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
