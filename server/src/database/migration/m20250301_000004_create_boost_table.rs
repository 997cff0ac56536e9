use sea_orm_migration::prelude::*;

use crate::database::entity::attachment;
use crate::database::entity::boost::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000004_create_boost_table"
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
                        ColumnDef::new(Column::Status)
                            .r#char()
                            .char_len(1)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::Destination).integer().not_null())
                    .col(ColumnDef::new(Column::AttachmentId).big_integer().not_null())
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
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_boost_attachment")
                            .from_tbl(Entity)
                            .from_col(Column::AttachmentId)
                            .to_tbl(attachment::Entity)
                            .to_col(attachment::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-boost-attachment-id")
                    .table(Entity)
                    .col(Column::AttachmentId)
                    .to_owned(),
            )
            .await
    }
}
