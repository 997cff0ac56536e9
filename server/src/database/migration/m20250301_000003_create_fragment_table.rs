use sea_orm_migration::prelude::*;

use crate::database::entity::fragment::*;
use crate::database::entity::pool;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000003_create_fragment_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Column::Rid)
                            .string_len(16)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::Uuid).string().not_null())
                    .col(ColumnDef::new(Column::Name).string().not_null())
                    .col(ColumnDef::new(Column::Alt).text().not_null())
                    .col(ColumnDef::new(Column::Usage).string().not_null())
                    .col(ColumnDef::new(Column::MimeType).string().not_null())
                    .col(ColumnDef::new(Column::Size).big_integer().not_null())
                    .col(ColumnDef::new(Column::Fingerprint).string().null())
                    .col(ColumnDef::new(Column::Chunks).text().not_null())
                    .col(ColumnDef::new(Column::Usermeta).text().not_null())
                    .col(
                        ColumnDef::new(Column::IsIndexable)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Column::IsMerging)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Column::PoolId).big_integer().null())
                    .col(ColumnDef::new(Column::AccountId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_fragment_pool")
                            .from_tbl(Entity)
                            .from_col(Column::PoolId)
                            .to_tbl(pool::Entity)
                            .to_col(pool::Column::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-fragment-fingerprint")
                    .table(Entity)
                    .col(Column::AccountId)
                    .col(Column::Fingerprint)
                    .to_owned(),
            )
            .await
    }
}
