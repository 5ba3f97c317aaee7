use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConfigItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConfigItems::KeyName)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConfigItems::ValueJson).text().not_null())
                    .col(
                        ColumnDef::new(ConfigItems::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConfigItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConfigItems {
    Table,
    KeyName,
    ValueJson,
    UpdatedAt,
}
