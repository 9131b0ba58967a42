use sea_orm::entity::prelude::*;

/// One row per admin counter reset. Events created before the newest row are
/// left out when counters are seeded at startup.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "analytics_resets")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub reset_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
