use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "flight_plans_received")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub callsign: Option<String>,
    pub destination: Option<String>,
    pub route: Option<String>,
    pub flight_level: Option<String>,
    /// `Main` or `Event`.
    pub source: String,
    /// The full upstream payload as JSON text.
    #[sea_orm(column_type = "Text")]
    pub raw: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
