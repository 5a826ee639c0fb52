pub mod runtime_deploy_task;
pub mod runtime_deploy_task_log;
