//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "runtime_deploy_task")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_id: String,
    pub runtime_mode: String,
    pub namespace: String,
    pub target_env: String,
    pub slot_no: i32,
    pub repository_full_name: String,
    pub services_yaml_path: String,
    pub build_ref: String,
    pub deploy_only: bool,
    pub status: String,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTimeWithTimeZone>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub result_namespace: Option<String>,
    pub result_target_env: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::runtime_deploy_task_log::Entity")]
    RuntimeDeployTaskLog,
}

impl Related<super::runtime_deploy_task_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RuntimeDeployTaskLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
