//! Database migrations.

pub use sea_orm_migration::*;

mod m20250301_000001_create_pool_table;
mod m20250301_000002_create_attachment_table;
mod m20250301_000003_create_fragment_table;
mod m20250301_000004_create_boost_table;
mod m20250301_000005_create_content_claim_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_pool_table::Migration),
            Box::new(m20250301_000002_create_attachment_table::Migration),
            Box::new(m20250301_000003_create_fragment_table::Migration),
            Box::new(m20250301_000004_create_boost_table::Migration),
            Box::new(m20250301_000005_create_content_claim_table::Migration),
        ]
    }
}
