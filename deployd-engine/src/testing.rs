//! In-memory collaborators for engine tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use deployd_common::{
    kube::{AppliedResourceRef, ConfigMapData, KubernetesClient, SecretData},
    manifest::parse_manifest_refs,
    task::{AppendLogParams, ListFilter, Task, TaskLogEntry, TaskRepository, TaskStatus},
    PrepareParams, PrepareResult,
};

use crate::{
    config::DeployConfig,
    registry::{RegistryClient, TagInfo},
    service::DeployService,
    stack::YamlStackLoader,
};

pub(crate) fn service(
    kube: Arc<FakeKube>,
    tasks: Arc<MemoryTasks>,
    cfg: DeployConfig,
) -> DeployService {
    DeployService::new(cfg, kube, tasks, Arc::new(YamlStackLoader)).unwrap()
}

#[derive(Default)]
struct KubeState {
    calls: Vec<String>,
    manifests: Vec<String>,
    namespaces: BTreeSet<String>,
    secrets: BTreeMap<(String, String), SecretData>,
    config_maps: BTreeMap<(String, String), ConfigMapData>,
    failing_waits: HashSet<String>,
    job_logs: String,
    hang_waits: bool,
}

/// Records cluster calls and keeps secrets and config maps in memory.
#[derive(Default)]
pub(crate) struct FakeKube {
    state: Mutex<KubeState>,
}

impl FakeKube {
    /// `apply`, `delete job` and `wait` calls in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn applied_manifests(&self) -> Vec<String> {
        self.state.lock().unwrap().manifests.clone()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().unwrap().namespaces.iter().cloned().collect()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretData> {
        let state = self.state.lock().unwrap();
        state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: SecretData) {
        let mut state = self.state.lock().unwrap();
        state
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMapData> {
        let state = self.state.lock().unwrap();
        state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every wait for an object called `name` fails.
    pub fn fail_wait(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_waits
            .insert(name.to_string());
    }

    /// Waits never return until the caller gives up on them.
    pub fn hang_waits(&self, hang: bool) {
        self.state.lock().unwrap().hang_waits = hang;
    }

    pub fn set_job_logs(&self, logs: &str) {
        self.state.lock().unwrap().job_logs = logs.to_string();
    }

    async fn wait(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let (fail, hang) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("wait {kind} {namespace}/{name}"));
            (state.failing_waits.contains(name), state.hang_waits)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(anyhow!("{kind} {namespace}/{name} did not become ready"));
        }
        Ok(())
    }
}

#[async_trait]
impl KubernetesClient for FakeKube {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(namespace.to_string());
        Ok(())
    }

    async fn upsert_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()> {
        self.put_secret(namespace, name, data);
        Ok(())
    }

    async fn upsert_tls_secret(&self, namespace: &str, name: &str, data: SecretData) -> Result<()> {
        self.put_secret(namespace, name, data);
        Ok(())
    }

    async fn upsert_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: ConfigMapData,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn get_secret_data(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self.secret(namespace, name))
    }

    async fn delete_job_if_exists(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("delete job {namespace}/{name}"));
        Ok(())
    }

    async fn wait_for_job_complete(
        &self,
        namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.wait("job", namespace, name).await
    }

    async fn get_job_logs(&self, _namespace: &str, _name: &str, _tail_lines: i64) -> Result<String> {
        Ok(self.state.lock().unwrap().job_logs.clone())
    }

    async fn wait_for_deployment_ready(
        &self,
        namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.wait("deployment", namespace, name).await
    }

    async fn wait_for_stateful_set_ready(
        &self,
        namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.wait("statefulset", namespace, name).await
    }

    async fn wait_for_daemon_set_ready(
        &self,
        namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.wait("daemonset", namespace, name).await
    }

    async fn apply_manifest(
        &self,
        manifest: &[u8],
        namespace_override: &str,
        _field_manager: &str,
    ) -> Result<Vec<AppliedResourceRef>> {
        let refs = parse_manifest_refs(manifest, namespace_override)?;
        let mut state = self.state.lock().unwrap();
        for r in &refs {
            state
                .calls
                .push(format!("apply {namespace_override} {}/{}", r.kind, r.name));
        }
        state
            .manifests
            .push(String::from_utf8_lossy(manifest).into_owned());
        Ok(refs)
    }
}

#[derive(Default)]
struct TaskState {
    tasks: BTreeMap<String, Task>,
    logs: Vec<AppendLogParams>,
}

/// Task queue with the same lease rules as the database repository.
#[derive(Default)]
pub(crate) struct MemoryTasks {
    state: Mutex<TaskState>,
    fail_log_appends: AtomicBool,
}

impl MemoryTasks {
    pub fn logs(&self, run_id: &str) -> Vec<AppendLogParams> {
        let state = self.state.lock().unwrap();
        state
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn messages(&self, run_id: &str) -> Vec<String> {
        self.logs(run_id).into_iter().map(|l| l.message).collect()
    }

    pub fn fail_log_appends(&self, fail: bool) {
        self.fail_log_appends.store(fail, Ordering::SeqCst);
    }

    pub fn task(&self, run_id: &str) -> Option<Task> {
        self.state.lock().unwrap().tasks.get(run_id).cloned()
    }

    /// Pushes the lease of a running task into the past.
    pub fn expire_lease(&self, run_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(run_id) {
            task.lease_until = Some((Utc::now() - chrono::Duration::seconds(1)).fixed_offset());
        }
    }

    fn holds_lease(task: &Task, lease_owner: &str) -> bool {
        task.status == TaskStatus::Running
            && task.lease_owner.as_deref() == Some(lease_owner)
            && task.lease_until.is_some_and(|until| until > Utc::now())
    }

    fn finish(
        &self,
        run_id: &str,
        lease_owner: &str,
        update: impl FnOnce(&mut Task),
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(run_id) else {
            return Ok(false);
        };
        if !Self::holds_lease(task, lease_owner) {
            return Ok(false);
        }
        let now = Utc::now().fixed_offset();
        update(task);
        task.lease_owner = None;
        task.lease_until = None;
        task.updated_at = now;
        task.finished_at = Some(now);
        Ok(true)
    }
}

fn new_task(params: &PrepareParams) -> Task {
    let now = Utc::now().fixed_offset();
    Task {
        run_id: params.run_id.clone(),
        runtime_mode: params.runtime_mode.clone(),
        namespace: params.namespace.clone(),
        target_env: params.target_env.clone(),
        slot_no: params.slot_no,
        repository_full_name: params.repository_full_name.clone(),
        services_yaml_path: params.services_yaml_path.clone(),
        build_ref: params.build_ref.clone(),
        deploy_only: params.deploy_only,
        status: TaskStatus::Pending,
        lease_owner: None,
        lease_until: None,
        attempts: 0,
        last_error: None,
        result_namespace: None,
        result_target_env: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        finished_at: None,
        logs: vec![],
    }
}

#[async_trait]
impl TaskRepository for MemoryTasks {
    async fn upsert_desired(&self, params: &PrepareParams) -> Result<Task> {
        let mut state = self.state.lock().unwrap();
        let task = match state.tasks.get(&params.run_id) {
            None => new_task(params),
            Some(task) if task.should_reset(params) => Task {
                created_at: task.created_at,
                attempts: task.attempts,
                ..new_task(params)
            },
            Some(task) => return Ok(task.clone()),
        };
        state.tasks.insert(task.run_id.clone(), task.clone());
        Ok(task)
    }

    async fn get_by_run_id(&self, run_id: &str) -> Result<Option<Task>> {
        let state = self.state.lock().unwrap();
        Ok(state.tasks.get(run_id).map(|task| Task {
            logs: state
                .logs
                .iter()
                .filter(|l| l.run_id == run_id)
                .map(|l| TaskLogEntry {
                    stage: l.stage.clone(),
                    level: l.level.clone(),
                    message: l.message.clone(),
                    created_at: task.updated_at,
                })
                .collect(),
            ..task.clone()
        }))
    }

    async fn claim_next(&self, lease_owner: &str, lease_ttl: Duration) -> Result<Option<Task>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut candidates: Vec<&mut Task> = state
            .tasks
            .values_mut()
            .filter(|task| match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Running => task.lease_until.map_or(true, |until| until <= now),
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|task| task.created_at);
        let Some(task) = candidates.into_iter().next() else {
            return Ok(None);
        };
        let ttl = chrono::Duration::from_std(lease_ttl)?;
        task.status = TaskStatus::Running;
        task.lease_owner = Some(lease_owner.to_string());
        task.lease_until = Some((now + ttl).fixed_offset());
        task.attempts += 1;
        task.started_at = Some(now.fixed_offset());
        task.updated_at = now.fixed_offset();
        Ok(Some(task.clone()))
    }

    async fn mark_succeeded(
        &self,
        run_id: &str,
        lease_owner: &str,
        result: &PrepareResult,
    ) -> Result<bool> {
        self.finish(run_id, lease_owner, |task| {
            task.status = TaskStatus::Succeeded;
            task.last_error = None;
            task.result_namespace = Some(result.namespace.clone());
            task.result_target_env = Some(result.target_env.clone());
        })
    }

    async fn mark_failed(&self, run_id: &str, lease_owner: &str, last_error: &str) -> Result<bool> {
        self.finish(run_id, lease_owner, |task| {
            task.status = TaskStatus::Failed;
            task.last_error = Some(last_error.to_string());
        })
    }

    async fn renew_lease(&self, run_id: &str, lease_owner: &str, lease_ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(run_id) else {
            return Ok(false);
        };
        if !Self::holds_lease(task, lease_owner) {
            return Ok(false);
        }
        let now = Utc::now();
        task.lease_until = Some((now + chrono::Duration::from_std(lease_ttl)?).fixed_offset());
        task.updated_at = now.fixed_offset();
        Ok(true)
    }

    async fn cancel(&self, run_id: &str, reason: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(run_id) else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now().fixed_offset();
        task.status = TaskStatus::Canceled;
        task.last_error = Some(reason.to_string());
        task.lease_owner = None;
        task.lease_until = None;
        task.updated_at = now;
        task.finished_at = Some(now);
        Ok(true)
    }

    async fn list_recent(&self, filter: ListFilter) -> Result<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| filter.status.map_or(true, |status| task.status == status))
            .filter(|task| {
                filter
                    .target_env
                    .as_deref()
                    .map_or(true, |env| task.target_env == env)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        tasks.truncate(filter.effective_limit() as usize);
        Ok(tasks)
    }

    async fn append_log(&self, params: AppendLogParams) -> Result<()> {
        if self.fail_log_appends.load(Ordering::SeqCst) {
            return Err(anyhow!("task log store unavailable"));
        }
        let params = params.normalized();
        if params.message.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.logs.push(params.clone());
        let lines: Vec<usize> = state
            .logs
            .iter()
            .enumerate()
            .filter(|(_, l)| l.run_id == params.run_id)
            .map(|(idx, _)| idx)
            .collect();
        let excess = lines.len().saturating_sub(params.max_lines as usize);
        for idx in lines.into_iter().take(excess).rev() {
            state.logs.remove(idx);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    tags: BTreeMap<String, Vec<String>>,
    failing: HashSet<String>,
    deleted: Vec<String>,
}

/// Registry holding tag names per repository, newest first.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn put_tags(&self, repository: &str, tags: &[&str]) {
        self.state.lock().unwrap().tags.insert(
            repository.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn fail_listing(&self, repository: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(repository.to_string());
    }

    /// `repository:tag` of every deletion in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn tags(&self, repository: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn list_tags(&self, repository: &str) -> Result<Vec<TagInfo>> {
        let state = self.state.lock().unwrap();
        if state.failing.contains(repository) {
            return Err(anyhow!("registry unavailable"));
        }
        Ok(state
            .tags
            .get(repository)
            .map(|tags| {
                tags.iter()
                    .map(|tag| TagInfo {
                        tag: tag.clone(),
                        digest: format!("sha256:{tag}"),
                        created_at: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(format!("{repository}:{tag}"));
        let Some(tags) = state.tags.get_mut(repository) else {
            return Ok(false);
        };
        let before = tags.len();
        tags.retain(|t| t != tag);
        Ok(tags.len() != before)
    }
}
