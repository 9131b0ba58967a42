//! Login session entity model.
//!
//! Maps to the `login_sessions` table used by the `tower-sessions` store that
//! keeps authenticated users logged in across restarts.

use sea_orm::entity::prelude::*;

/// A persisted `tower-sessions` record.
///
/// | Column      | Type               | Description                          |
/// |-------------|--------------------|--------------------------------------|
/// | id          | TEXT (Primary Key) | Session ID                           |
/// | data        | BYTEA / BLOB       | MessagePack serialized record        |
/// | expiry_date | TIMESTAMPTZ        | Expiration date of the session       |
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "login_sessions")]
pub struct Model {
    /// String form of `tower_sessions::session::Id`.
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    /// MessagePack encoding of the whole `Record`, including its expiry.
    pub data: Vec<u8>,

    /// Records at or past this instant are treated as absent and removed by
    /// the expiry task.
    pub expiry_date: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
