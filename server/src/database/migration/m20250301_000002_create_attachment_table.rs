use sea_orm_migration::prelude::*;

use crate::database::entity::attachment::*;
use crate::database::entity::pool;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000002_create_attachment_table"
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
                    .col(ColumnDef::new(Column::DetectedMimeType).string().null())
                    .col(ColumnDef::new(Column::Size).big_integer().not_null())
                    .col(ColumnDef::new(Column::Hash).string().null())
                    .col(ColumnDef::new(Column::Destination).integer().not_null())
                    .col(
                        ColumnDef::new(Column::RefCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Column::Kind)
                            .r#char()
                            .char_len(1)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::Metadata).text().not_null())
                    .col(ColumnDef::new(Column::Usermeta).text().not_null())
                    .col(ColumnDef::new(Column::IsUploaded).boolean().not_null())
                    .col(ColumnDef::new(Column::IsAnalyzed).boolean().not_null())
                    .col(ColumnDef::new(Column::IsSelfRef).boolean().not_null())
                    .col(ColumnDef::new(Column::IsIndexable).boolean().not_null())
                    .col(ColumnDef::new(Column::RefId).big_integer().null())
                    .col(ColumnDef::new(Column::ThumbnailId).big_integer().null())
                    .col(ColumnDef::new(Column::CompressedId).big_integer().null())
                    .col(ColumnDef::new(Column::PoolId).big_integer().null())
                    .col(ColumnDef::new(Column::AccountId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::CleanedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_attachment_pool")
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
                    .name("idx-attachment-hash")
                    .table(Entity)
                    .col(Column::Hash)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-attachment-ref-id")
                    .table(Entity)
                    .col(Column::RefId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-attachment-pool-id")
                    .table(Entity)
                    .col(Column::PoolId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-attachment-account-id")
                    .table(Entity)
                    .col(Column::AccountId)
                    .to_owned(),
            )
            .await
    }
}
