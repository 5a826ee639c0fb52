use std::{collections::BTreeMap, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FIELD_MANAGER: &str = "codex-k8s-control-plane";

pub type SecretData = BTreeMap<String, Vec<u8>>;
pub type ConfigMapData = BTreeMap<String, String>;

/// Identity of one object found in a rendered manifest.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AppliedResourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Cluster operations the deploy engine relies on.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    async fn upsert_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()>;

    /// Same as `upsert_secret` but stores the secret as `kubernetes.io/tls`.
    async fn upsert_tls_secret(&self, namespace: &str, name: &str, data: SecretData)
        -> Result<()>;

    async fn upsert_config_map(&self, namespace: &str, name: &str, data: ConfigMapData)
        -> Result<()>;

    /// Returns `None` when the secret doesn't exist.
    async fn get_secret_data(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    async fn delete_job_if_exists(&self, namespace: &str, name: &str) -> Result<()>;

    async fn wait_for_job_complete(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<()>;

    async fn get_job_logs(&self, namespace: &str, name: &str, tail_lines: i64) -> Result<String>;

    async fn wait_for_deployment_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn wait_for_stateful_set_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn wait_for_daemon_set_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Server-side applies every object in `manifest`. Namespaced objects
    /// without a namespace are placed into `namespace_override`.
    async fn apply_manifest(
        &self,
        manifest: &[u8],
        namespace_override: &str,
        field_manager: &str,
    ) -> Result<Vec<AppliedResourceRef>>;
}
