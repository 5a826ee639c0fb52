use sea_orm_migration::prelude::*;

pub mod m20250910_081522_create_runtime_deploy_task_table;
pub mod m20250910_082004_create_runtime_deploy_task_log_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250910_081522_create_runtime_deploy_task_table::Migration),
            Box::new(m20250910_082004_create_runtime_deploy_task_log_table::Migration),
        ]
    }
}
