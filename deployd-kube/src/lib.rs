use std::{future::Future, time::Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deployd_common::{
    kube::{AppliedResourceRef, ConfigMapData, KubernetesClient, SecretData},
    manifest::{manifest_documents, object_ref},
};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        batch::v1::Job,
        core::v1::{ConfigMap, Namespace, Pod, Secret},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString,
};
use kube::{
    api::{DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{pinned_kind, Scope},
    Api,
};
use serde_json::Value;
use tokio::time::{sleep, Duration};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const JOB_DELETE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub async fn new() -> Result<Self> {
        let config = kube::Config::infer().await?;
        let client = kube::Client::try_from(config)?;
        Ok(Self { client })
    }

    pub fn from_client(client: kube::Client) -> Self {
        Self { client }
    }

    async fn upsert_secret_with_type(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        type_: &str,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            type_: Some(type_.to_string()),
            ..Default::default()
        };
        match api.get_opt(name).await? {
            Some(existing) => {
                secret.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &secret)
                    .await
                    .map_err(|e| anyhow!("replace secret {namespace}/{name}: {e}"))?;
            }
            None => {
                api.create(&PostParams::default(), &secret)
                    .await
                    .map_err(|e| anyhow!("create secret {namespace}/{name}: {e}"))?;
            }
        }
        Ok(())
    }
}

/// Polls `check` every two seconds until it reports done or `timeout` passes.
async fn poll_until<F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(anyhow!("timed out after {timeout:?} waiting for {what}"));
        }
        sleep(POLL_INTERVAL).await;
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn job_finished(job: &Job) -> Result<bool> {
    let conditions = job
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref());
    for condition in conditions.into_iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return Ok(true),
            "Failed" => {
                return Err(anyhow!(
                    "job {} failed: {}",
                    job.metadata.name.as_deref().unwrap_or_default(),
                    condition.message.as_deref().unwrap_or("no message")
                ))
            }
            _ => {}
        }
    }
    Ok(false)
}

fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    if status.observed_generation.unwrap_or(0) < deployment.metadata.generation.unwrap_or(0) {
        return false;
    }
    if status.updated_replicas.unwrap_or(0) < desired
        || status.available_replicas.unwrap_or(0) < desired
    {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Available" && c.status == "True")
}

fn stateful_set_ready(stateful_set: &StatefulSet) -> bool {
    let desired = stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    stateful_set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0)
        >= desired
}

fn daemon_set_ready(daemon_set: &DaemonSet) -> bool {
    let Some(status) = daemon_set.status.as_ref() else {
        return false;
    };
    status.desired_number_scheduled > 0 && status.number_ready >= status.desired_number_scheduled
}

#[async_trait]
impl KubernetesClient for KubeClient {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(anyhow!("ensure namespace: namespace is required"));
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(namespace).await?.is_some() {
            return Ok(());
        }
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                tracing::info!(namespace, "namespace created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(anyhow!("create namespace {namespace}: {e}")),
        }
    }

    async fn upsert_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()> {
        self.upsert_secret_with_type(namespace, name, data, "Opaque")
            .await
    }

    async fn upsert_tls_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()> {
        self.upsert_secret_with_type(namespace, name, data, "kubernetes.io/tls")
            .await
    }

    async fn upsert_config_map(&self, namespace: &str, name: &str, data: ConfigMapData) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let mut config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        match api.get_opt(name).await? {
            Some(existing) => {
                config_map.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &config_map)
                    .await
                    .map_err(|e| anyhow!("replace configmap {namespace}/{name}: {e}"))?;
            }
            None => {
                api.create(&PostParams::default(), &config_map)
                    .await
                    .map_err(|e| anyhow!("create configmap {namespace}/{name}: {e}"))?;
            }
        }
        Ok(())
    }

    async fn get_secret_data(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect();
        Ok(Some(data))
    }

    async fn delete_job_if_exists(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(anyhow!("delete job {namespace}/{name}: {e}")),
        }
        tracing::info!(namespace, job = name, "deleted previous job");
        let api = &api;
        poll_until(
            &format!("job {namespace}/{name} deletion"),
            JOB_DELETE_TIMEOUT,
            move || async move { Ok(api.get_opt(name).await?.is_none()) },
        )
        .await
    }

    async fn wait_for_job_complete(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        poll_until(&format!("job {namespace}/{name}"), timeout, move || async move {
            match api.get_opt(name).await? {
                Some(job) => job_finished(&job),
                None => Ok(false),
            }
        })
        .await
    }

    async fn get_job_logs(&self, namespace: &str, name: &str, tail_lines: i64) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&format!("job-name={name}")))
            .await?;
        let pod_name = pods
            .items
            .iter()
            .max_by_key(|pod| pod.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| anyhow!("no pods found for job {namespace}/{name}"))?;
        let params = LogParams {
            tail_lines: (tail_lines > 0).then_some(tail_lines),
            ..Default::default()
        };
        let logs = api
            .logs(&pod_name, &params)
            .await
            .map_err(|e| anyhow!("get logs of pod {namespace}/{pod_name}: {e}"))?;
        Ok(logs)
    }

    async fn wait_for_deployment_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        poll_until(&format!("deployment {namespace}/{name}"), timeout, move || async move {
            Ok(api.get_opt(name).await?.is_some_and(|d| deployment_ready(&d)))
        })
        .await
    }

    async fn wait_for_stateful_set_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        poll_until(&format!("statefulset {namespace}/{name}"), timeout, move || async move {
            Ok(api.get_opt(name).await?.is_some_and(|s| stateful_set_ready(&s)))
        })
        .await
    }

    async fn wait_for_daemon_set_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        poll_until(&format!("daemonset {namespace}/{name}"), timeout, move || async move {
            Ok(api.get_opt(name).await?.is_some_and(|d| daemon_set_ready(&d)))
        })
        .await
    }

    async fn apply_manifest(
        &self,
        manifest: &[u8],
        namespace_override: &str,
        field_manager: &str,
    ) -> Result<Vec<AppliedResourceRef>> {
        let params = PatchParams::apply(field_manager).force();
        let mut applied = Vec::new();
        for mut object in manifest_documents(manifest)? {
            let mut object_ref = object_ref(&object, "");
            if object_ref.api_version.is_empty() || object_ref.kind.is_empty() {
                return Err(anyhow!("manifest object is missing apiVersion or kind"));
            }
            if object_ref.name.is_empty() {
                return Err(anyhow!(
                    "manifest object {} is missing metadata.name",
                    object_ref.kind
                ));
            }

            let (group, version) = split_api_version(&object_ref.api_version);
            let gvk = GroupVersionKind::gvk(group, version, &object_ref.kind);
            let (resource, capabilities) = pinned_kind(&self.client, &gvk).await.map_err(|e| {
                anyhow!(
                    "resolve {} {}: {e}",
                    object_ref.api_version,
                    object_ref.kind
                )
            })?;

            let api: Api<DynamicObject> = if matches!(capabilities.scope, Scope::Namespaced) {
                if object_ref.namespace.is_empty() {
                    object_ref.namespace = namespace_override.trim().to_string();
                }
                if object_ref.namespace.is_empty() {
                    return Err(anyhow!(
                        "namespace is required for {}/{}",
                        object_ref.kind,
                        object_ref.name
                    ));
                }
                if let Some(metadata) = object.pointer_mut("/metadata").and_then(Value::as_object_mut) {
                    metadata.insert(
                        "namespace".to_string(),
                        Value::String(object_ref.namespace.clone()),
                    );
                }
                Api::namespaced_with(self.client.clone(), &object_ref.namespace, &resource)
            } else {
                object_ref.namespace.clear();
                Api::all_with(self.client.clone(), &resource)
            };

            api.patch(&object_ref.name, &params, &Patch::Apply(&object))
                .await
                .map_err(|e| {
                    anyhow!(
                        "apply {}/{} in {:?}: {e}",
                        object_ref.kind,
                        object_ref.name,
                        object_ref.namespace
                    )
                })?;
            tracing::debug!(
                kind = object_ref.kind,
                name = object_ref.name,
                namespace = object_ref.namespace,
                "applied object"
            );
            applied.push(object_ref);
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{
            DaemonSetStatus, DeploymentCondition, DeploymentSpec, DeploymentStatus, StatefulSetSpec,
            StatefulSetStatus,
        },
        batch::v1::{JobCondition, JobStatus},
    };

    use super::*;

    fn deployment(replicas: i32, available: i32, condition: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(2),
                updated_replicas: Some(available),
                available_replicas: Some(available),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: condition.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn api_version_split() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn deployment_readiness() {
        assert!(deployment_ready(&deployment(2, 2, "True")));
        assert!(!deployment_ready(&deployment(2, 1, "True")));
        assert!(!deployment_ready(&deployment(1, 1, "False")));

        let mut stale = deployment(1, 1, "True");
        stale.metadata.generation = Some(3);
        assert!(!deployment_ready(&stale));
    }

    #[test]
    fn stateful_and_daemon_set_readiness() {
        let stateful_set = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: None,
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(stateful_set_ready(&stateful_set));
        assert!(!stateful_set_ready(&StatefulSet::default()));

        let daemon_set = |desired, ready| DaemonSet {
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(daemon_set_ready(&daemon_set(3, 3)));
        assert!(!daemon_set_ready(&daemon_set(3, 2)));
        assert!(!daemon_set_ready(&daemon_set(0, 0)));
    }

    #[test]
    fn job_conditions() {
        let job = |type_: &str, status: &str| Job {
            metadata: ObjectMeta {
                name: Some("build".to_string()),
                ..Default::default()
            },
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    message: Some("BackoffLimitExceeded".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_finished(&job("Complete", "True")).unwrap());
        assert!(!job_finished(&job("Complete", "False")).unwrap());
        let err = job_finished(&job("Failed", "True")).unwrap_err();
        assert!(err.to_string().contains("BackoffLimitExceeded"));
        assert!(!job_finished(&Job::default()).unwrap());
    }
}
