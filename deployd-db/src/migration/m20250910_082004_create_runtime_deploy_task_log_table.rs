use sea_orm_migration::prelude::*;

use super::m20250910_081522_create_runtime_deploy_task_table::RuntimeDeployTask;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RuntimeDeployTaskLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RuntimeDeployTaskLog::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RuntimeDeployTaskLog::RunId).string().not_null())
                    .col(ColumnDef::new(RuntimeDeployTaskLog::Stage).string().not_null())
                    .col(ColumnDef::new(RuntimeDeployTaskLog::Level).string().not_null())
                    .col(ColumnDef::new(RuntimeDeployTaskLog::Message).text().not_null())
                    .col(
                        ColumnDef::new(RuntimeDeployTaskLog::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from_tbl(RuntimeDeployTaskLog::Table)
                            .from_col(RuntimeDeployTaskLog::RunId)
                            .to_tbl(RuntimeDeployTask::Table)
                            .to_col(RuntimeDeployTask::RunId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("runtime_deploy_task_log_run_id_created_at_idx")
                    .table(RuntimeDeployTaskLog::Table)
                    .col(RuntimeDeployTaskLog::RunId)
                    .col(RuntimeDeployTaskLog::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum RuntimeDeployTaskLog {
    Table,
    Id,
    RunId,
    Stage,
    Level,
    Message,
    CreatedAt,
}
