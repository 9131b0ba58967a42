use sea_orm::entity::prelude::*;

/// An account that has logged in through Discord at least once.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "discord_users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub discord_id: String,
    pub username: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    /// Only changed through the admin endpoints, never by a login.
    pub is_admin: bool,
    /// JSON array of role names.
    #[sea_orm(column_type = "Text")]
    pub roles: String,
    pub last_login: DateTimeWithTimeZone,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn role_list(&self) -> Vec<String> {
        serde_json::from_str(&self.roles).unwrap_or_default()
    }
}
