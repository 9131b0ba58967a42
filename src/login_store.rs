use std::fmt::Debug;

use async_trait::async_trait;
use chrono::DateTime;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use time::OffsetDateTime;
use tower_sessions::{
    session::Id, session::Record, session_store, ExpiredDeletion, MemoryStore, SessionStore,
};

use crate::entity::login_session::{self, ActiveModel as LoginActiveModel, Entity as LoginEntity};

/// Keeps authenticated login sessions in the `login_sessions` table.
///
/// Each [`Record`] is stored whole, MessagePack encoded, next to its expiry
/// so that expired rows can be filtered and purged without decoding them.
///
/// Errors map onto `tower_sessions::session_store::Error`:
///
/// - Database errors → `session_store::Error::Backend`
/// - Serialization errors → `session_store::Error::Encode`
/// - Deserialization errors → `session_store::Error::Decode`
#[derive(Debug, Clone)]
pub struct DatabaseLoginStore {
    conn: DatabaseConnection,
}

impl DatabaseLoginStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }
}

fn backend(err: sea_orm::DbErr) -> session_store::Error {
    session_store::Error::Backend(err.to_string())
}

fn encode(record: &Record) -> session_store::Result<(Vec<u8>, DateTimeWithTimeZone)> {
    let data =
        rmp_serde::to_vec(record).map_err(|e| session_store::Error::Encode(e.to_string()))?;
    Ok((data, to_db_time(record.expiry_date)?))
}

#[async_trait]
impl SessionStore for DatabaseLoginStore {
    /// Inserts a new record, drawing a fresh id until it does not collide
    /// with an existing row.
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        let txn = self.conn.begin().await.map_err(backend)?;

        while LoginEntity::find_by_id(record.id.to_string())
            .one(&txn)
            .await
            .map_err(backend)?
            .is_some()
        {
            record.id = Id::default();
        }

        let (data, expiry_date) = encode(record)?;
        LoginActiveModel {
            id: Set(record.id.to_string()),
            data: Set(data),
            expiry_date: Set(expiry_date),
        }
        .insert(&txn)
        .await
        .map_err(backend)?;

        txn.commit().await.map_err(backend)
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        let (data, expiry_date) = encode(record)?;
        let model = LoginActiveModel {
            id: Set(record.id.to_string()),
            data: Set(data),
            expiry_date: Set(expiry_date),
        };

        LoginEntity::insert(model)
            .on_conflict(
                OnConflict::column(login_session::Column::Id)
                    .update_columns([
                        login_session::Column::Data,
                        login_session::Column::ExpiryDate,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await
            .map_err(backend)?;

        Ok(())
    }

    /// Expired rows are treated as absent.
    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        let now = to_db_time(OffsetDateTime::now_utc())?;

        let found = LoginEntity::find_by_id(session_id.to_string())
            .filter(login_session::Column::ExpiryDate.gt(now))
            .one(&self.conn)
            .await
            .map_err(backend)?;

        found
            .map(|model| {
                rmp_serde::from_slice(&model.data)
                    .map_err(|e| session_store::Error::Decode(e.to_string()))
            })
            .transpose()
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        LoginEntity::delete_by_id(session_id.to_string())
            .exec(&self.conn)
            .await
            .map_err(backend)?;

        Ok(())
    }
}

#[async_trait]
impl ExpiredDeletion for DatabaseLoginStore {
    async fn delete_expired(&self) -> session_store::Result<()> {
        let now = to_db_time(OffsetDateTime::now_utc())?;

        let deleted = LoginEntity::delete_many()
            .filter(login_session::Column::ExpiryDate.lt(now))
            .exec(&self.conn)
            .await
            .map_err(backend)?;
        if deleted.rows_affected > 0 {
            tracing::debug!(deleted = deleted.rows_affected, "Purged expired login sessions");
        }

        Ok(())
    }
}

fn to_db_time(time: OffsetDateTime) -> session_store::Result<DateTimeWithTimeZone> {
    DateTime::from_timestamp(time.unix_timestamp(), time.nanosecond())
        .map(|utc| utc.fixed_offset())
        .ok_or_else(|| session_store::Error::Encode(format!("expiry {time} out of range")))
}

/// Login session backend: the datastore when one is configured, process
/// memory otherwise.
#[derive(Debug, Clone)]
pub enum LoginStore {
    Database(DatabaseLoginStore),
    Memory(MemoryStore),
}

impl LoginStore {
    pub fn new(conn: Option<DatabaseConnection>) -> Self {
        match conn {
            Some(conn) => LoginStore::Database(DatabaseLoginStore::new(conn)),
            None => LoginStore::Memory(MemoryStore::default()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, LoginStore::Database(_))
    }
}

#[async_trait]
impl SessionStore for LoginStore {
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        match self {
            LoginStore::Database(store) => store.create(record).await,
            LoginStore::Memory(store) => store.create(record).await,
        }
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        match self {
            LoginStore::Database(store) => store.save(record).await,
            LoginStore::Memory(store) => store.save(record).await,
        }
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        match self {
            LoginStore::Database(store) => store.load(session_id).await,
            LoginStore::Memory(store) => store.load(session_id).await,
        }
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        match self {
            LoginStore::Database(store) => store.delete(session_id).await,
            LoginStore::Memory(store) => store.delete(session_id).await,
        }
    }
}

#[async_trait]
impl ExpiredDeletion for LoginStore {
    /// The in-memory store already ignores expired records on load.
    async fn delete_expired(&self) -> session_store::Result<()> {
        match self {
            LoginStore::Database(store) => store.delete_expired().await,
            LoginStore::Memory(_) => Ok(()),
        }
    }
}
