pub use sea_orm_migration::prelude::*;

mod m20250101_000001_create_event_tables;
mod m20250101_000002_create_account_tables;
mod m20250101_000003_create_analytics_resets;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    // Keep clear of any migration table owned by the frontend's tooling.
    fn migration_table_name() -> sea_orm::DynIden {
        Alias::new("ifr_clearance_migrations").into_iden()
    }

    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_event_tables::Migration),
            Box::new(m20250101_000002_create_account_tables::Migration),
            Box::new(m20250101_000003_create_analytics_resets::Migration),
        ]
    }
}
