use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RuntimeDeployTask::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RuntimeDeployTask::RunId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RuntimeDeployTask::RuntimeMode)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RuntimeDeployTask::Namespace).string().not_null())
                    .col(ColumnDef::new(RuntimeDeployTask::TargetEnv).string().not_null())
                    .col(ColumnDef::new(RuntimeDeployTask::SlotNo).integer().not_null())
                    .col(
                        ColumnDef::new(RuntimeDeployTask::RepositoryFullName)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RuntimeDeployTask::ServicesYamlPath)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RuntimeDeployTask::BuildRef).string().not_null())
                    .col(
                        ColumnDef::new(RuntimeDeployTask::DeployOnly)
                            .boolean()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RuntimeDeployTask::Status).string().not_null())
                    .col(ColumnDef::new(RuntimeDeployTask::LeaseOwner).string())
                    .col(ColumnDef::new(RuntimeDeployTask::LeaseUntil).timestamp_with_time_zone())
                    .col(ColumnDef::new(RuntimeDeployTask::Attempts).integer().not_null())
                    .col(ColumnDef::new(RuntimeDeployTask::LastError).text())
                    .col(ColumnDef::new(RuntimeDeployTask::ResultNamespace).string())
                    .col(ColumnDef::new(RuntimeDeployTask::ResultTargetEnv).string())
                    .col(
                        ColumnDef::new(RuntimeDeployTask::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RuntimeDeployTask::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RuntimeDeployTask::StartedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(RuntimeDeployTask::FinishedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("runtime_deploy_task_status_created_at_idx")
                    .table(RuntimeDeployTask::Table)
                    .col(RuntimeDeployTask::Status)
                    .col(RuntimeDeployTask::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("runtime_deploy_task_updated_at_idx")
                    .table(RuntimeDeployTask::Table)
                    .col(RuntimeDeployTask::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum RuntimeDeployTask {
    Table,
    RunId,
    RuntimeMode,
    Namespace,
    TargetEnv,
    SlotNo,
    RepositoryFullName,
    ServicesYamlPath,
    BuildRef,
    DeployOnly,
    Status,
    LeaseOwner,
    LeaseUntil,
    Attempts,
    LastError,
    ResultNamespace,
    ResultTargetEnv,
    CreatedAt,
    UpdatedAt,
    StartedAt,
    FinishedAt,
}
