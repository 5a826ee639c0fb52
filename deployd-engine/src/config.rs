use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use deployd_common::kube::DEFAULT_FIELD_MANAGER;

pub const DEFAULT_SERVICES_CONFIG_PATH: &str = "services.yaml";

/// Runtime settings of the deploy engine.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub repository_root: PathBuf,
    pub services_config_path: PathBuf,
    pub rollout_timeout: Duration,
    pub kaniko_timeout: Duration,
    pub field_manager: String,
    pub github_pat: String,
    pub kaniko_job_log_tail_lines: i64,
    pub wait_poll_interval: Duration,
    pub repo_sync_timeout: Duration,
    pub echo_probe_interval: Duration,
    pub echo_probe_timeout: Duration,
    pub tls_wait_interval: Duration,
    /// Internal registry API, e.g. `http://codex-k8s-registry:5000`. Empty
    /// disables image mirroring and tag cleanup.
    pub registry_url: String,
    pub registry_cleanup_keep_tags: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            repository_root: PathBuf::from("."),
            services_config_path: PathBuf::from(DEFAULT_SERVICES_CONFIG_PATH),
            rollout_timeout: Duration::from_secs(20 * 60),
            kaniko_timeout: Duration::from_secs(30 * 60),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            github_pat: String::new(),
            kaniko_job_log_tail_lines: 200,
            wait_poll_interval: Duration::from_secs(2),
            repo_sync_timeout: Duration::from_secs(10 * 60),
            echo_probe_interval: Duration::from_secs(2),
            echo_probe_timeout: Duration::from_secs(3 * 60),
            tls_wait_interval: Duration::from_secs(3),
            registry_url: String::new(),
            registry_cleanup_keep_tags: 5,
        }
    }
}

impl DeployConfig {
    /// Replaces empty or zero settings with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.repository_root.as_os_str().is_empty() {
            self.repository_root = defaults.repository_root;
        }
        if self.services_config_path.as_os_str().is_empty() {
            self.services_config_path = defaults.services_config_path;
        }
        if self.rollout_timeout.is_zero() {
            self.rollout_timeout = defaults.rollout_timeout;
        }
        if self.kaniko_timeout.is_zero() {
            self.kaniko_timeout = defaults.kaniko_timeout;
        }
        self.field_manager = self.field_manager.trim().to_string();
        if self.field_manager.is_empty() {
            self.field_manager = defaults.field_manager;
        }
        self.github_pat = self.github_pat.trim().to_string();
        if self.kaniko_job_log_tail_lines <= 0 {
            self.kaniko_job_log_tail_lines = defaults.kaniko_job_log_tail_lines;
        }
        if self.wait_poll_interval.is_zero() {
            self.wait_poll_interval = defaults.wait_poll_interval;
        }
        if self.repo_sync_timeout.is_zero() {
            self.repo_sync_timeout = defaults.repo_sync_timeout;
        }
        if self.echo_probe_interval.is_zero() {
            self.echo_probe_interval = defaults.echo_probe_interval;
        }
        if self.echo_probe_timeout.is_zero() {
            self.echo_probe_timeout = defaults.echo_probe_timeout;
        }
        if self.tls_wait_interval.is_zero() {
            self.tls_wait_interval = defaults.tls_wait_interval;
        }
        self.registry_url = self.registry_url.trim().to_string();
        if self.registry_cleanup_keep_tags == 0 {
            self.registry_cleanup_keep_tags = defaults.registry_cleanup_keep_tags;
        }
        self
    }

    /// The services descriptor to load for a run rooted at `repo_root`.
    ///
    /// A path supplied by the run wins when the file exists. An absolute
    /// configured path prefers a file of the same name inside the repository,
    /// so a stale copy baked into the image doesn't pin the deploy logic.
    pub fn services_config_path(&self, repo_root: &Path, from_run: &str) -> PathBuf {
        let repo_root = if repo_root.as_os_str().is_empty() {
            self.repository_root.as_path()
        } else {
            repo_root
        };

        let from_run = from_run.trim();
        if !from_run.is_empty() {
            let candidate = repo_root.join(from_run);
            if candidate.is_file() {
                return candidate;
            }
        }

        let configured = self.services_config_path.as_path();
        if configured.is_absolute() {
            if let Some(base) = configured.file_name() {
                let by_base = repo_root.join(base);
                if by_base.is_file() {
                    return by_base;
                }
            }
            let repo_default = repo_root.join(DEFAULT_SERVICES_CONFIG_PATH);
            if repo_default.is_file() {
                return repo_default;
            }
            return configured.to_path_buf();
        }
        repo_root.join(configured)
    }
}
