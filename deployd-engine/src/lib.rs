pub mod apply;
pub mod build;
pub mod build_ref;
pub mod config;
pub mod image_vars;
pub mod orchestrator;
pub mod planner;
pub mod prerequisites;
pub mod reconciler;
pub mod registry;
pub mod render;
pub mod repo_sync;
pub mod service;
pub mod stack;
pub mod template_vars;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use config::DeployConfig;
pub use reconciler::ReconcilerLoop;
pub use service::DeployService;
