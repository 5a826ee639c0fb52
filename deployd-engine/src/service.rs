use std::{sync::Arc, time::Duration};

use anyhow::Result;
use deployd_common::{
    kube::KubernetesClient,
    task::{AppendLogParams, TaskRepository},
    utils::truncate_chars,
};

use crate::{
    config::DeployConfig,
    registry::{HttpRegistry, RegistryClient},
    stack::StackLoader,
};

const MAX_TASK_LOG_MESSAGE_CHARS: usize = 4000;
const MAX_TASK_LOG_LINES: u64 = 300;

/// Log levels used for task logs.
pub(crate) const INFO: &str = "info";
pub(crate) const WARNING: &str = "warning";
pub(crate) const ERROR: &str = "error";

/// Brings runtime environments to the state described by a stack descriptor.
///
/// The work is split over several files: `apply` holds the manifest applier,
/// `build` the Kaniko image builds, `tls` the certificate handling,
/// `repo_sync` the repository snapshots, `prerequisites` the platform secrets
/// and `orchestrator` the deploy flow and reconcile entry points.
#[derive(Clone)]
pub struct DeployService {
    pub(crate) cfg: Arc<DeployConfig>,
    pub(crate) kube: Arc<dyn KubernetesClient>,
    pub(crate) tasks: Arc<dyn TaskRepository>,
    pub(crate) stacks: Arc<dyn StackLoader>,
    pub(crate) registry: Option<Arc<dyn RegistryClient>>,
    pub(crate) http: reqwest::Client,
}

impl DeployService {
    pub fn new(
        cfg: DeployConfig,
        kube: Arc<dyn KubernetesClient>,
        tasks: Arc<dyn TaskRepository>,
        stacks: Arc<dyn StackLoader>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let cfg = cfg.normalized();
        let registry = match cfg.registry_url.as_str() {
            "" => None,
            url => Some(Arc::new(HttpRegistry::new(url, http.clone())?) as Arc<dyn RegistryClient>),
        };
        Ok(Self {
            cfg: Arc::new(cfg),
            kube,
            tasks,
            stacks,
            registry,
            http,
        })
    }

    /// Replaces the registry client built from `registry_url`.
    pub fn with_registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.cfg
    }

    /// Appends one user facing line to the task log. Failures only end up
    /// in the process log.
    pub async fn append_task_log(&self, run_id: &str, stage: &str, level: &str, message: &str) {
        let run_id = run_id.trim();
        let message = message.trim();
        if run_id.is_empty() || message.is_empty() {
            return;
        }
        let params = AppendLogParams {
            run_id: run_id.to_string(),
            stage: stage.trim().to_string(),
            level: level.trim().to_string(),
            message: truncate_chars(message, MAX_TASK_LOG_MESSAGE_CHARS),
            max_lines: MAX_TASK_LOG_LINES,
        };
        if let Err(e) = self.tasks.append_log(params).await {
            tracing::warn!(run_id, stage, level, "append runtime deploy task log failed: {e:#}");
        }
    }
}
