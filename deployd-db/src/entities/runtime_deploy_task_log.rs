//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "runtime_deploy_task_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub run_id: String,
    pub stage: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::runtime_deploy_task::Entity",
        from = "Column::RunId",
        to = "super::runtime_deploy_task::Column::RunId",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    RuntimeDeployTask,
}

impl Related<super::runtime_deploy_task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RuntimeDeployTask.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
