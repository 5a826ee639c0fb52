use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use deployd_common::{
    error::{is_cancelled, DeployError},
    task::TaskStatus,
    utils::truncate_chars,
    PrepareParams, PrepareResult, TemplateVars, DEFAULT_TARGET_ENV,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    image_vars::{apply_stack_image_vars, ensure_worker_job_image},
    service::{DeployService, ERROR, INFO},
    stack::{LoadOptions, LoadedStack},
    template_vars::{build_template_vars, initial_target_namespace, is_ai_env},
};

const PREPARE_STAGE: &str = "prepare";
const REPO_SYNC_STAGE: &str = "repo-sync";
const PREREQUISITES_STAGE: &str = "prerequisites";
const TLS_STAGE: &str = "tls";
const INFRASTRUCTURE_STAGE: &str = "infrastructure";
const BUILD_STAGE: &str = "build";
const SERVICES_STAGE: &str = "services";
const RECONCILE_STAGE: &str = "reconcile";

const MIN_LEASE_TTL: Duration = Duration::from_secs(1);
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(250);
const MAX_RENEW_INTERVAL: Duration = Duration::from_secs(30);
const MAX_LAST_ERROR_CHARS: usize = 4000;

const CODEX_K8S_PROJECT: &str = "codex-k8s";
const CERT_ISSUER_ENABLED_VAR: &str = "CODEXK8S_CERT_ISSUER_ENABLED";

impl DeployService {
    /// Deploys `params` right away, bypassing the task queue.
    pub async fn apply_now(&self, params: PrepareParams) -> Result<PrepareResult> {
        self.apply_desired_state(&params.normalized()).await
    }

    /// Records the deploy intent and waits until a reconciler has carried it
    /// out. A run that already succeeded returns its stored result.
    pub async fn prepare_run_environment(
        &self,
        params: PrepareParams,
        cancel: &CancellationToken,
    ) -> Result<PrepareResult> {
        let params = params.normalized();
        if params.run_id.is_empty() {
            return Err(anyhow!("run_id is required"));
        }
        let task = self
            .tasks
            .upsert_desired(&params)
            .await
            .context("upsert runtime deploy task")?;
        if task.status == TaskStatus::Succeeded {
            return Ok(task.prepare_result());
        }
        self.wait_for_task_result(&params.run_id, cancel).await
    }

    async fn wait_for_task_result(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PrepareResult> {
        loop {
            let task = self
                .tasks
                .get_by_run_id(run_id)
                .await
                .with_context(|| format!("load runtime deploy task run_id={run_id}"))?
                .ok_or_else(|| anyhow!("runtime deploy task for run_id={run_id} not found"))?;
            let last_error = task
                .last_error
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            match task.status {
                TaskStatus::Succeeded => return Ok(task.prepare_result()),
                TaskStatus::Failed if last_error.is_empty() => {
                    return Err(anyhow!("runtime deploy task failed for run_id={run_id}"));
                }
                TaskStatus::Failed => {
                    return Err(anyhow!(
                        "runtime deploy task failed for run_id={run_id}: {last_error}"
                    ));
                }
                TaskStatus::Canceled => {
                    return Err(DeployError::TaskCanceled {
                        run_id: run_id.to_string(),
                        reason: last_error,
                    }
                    .into());
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DeployError::Cancelled.into()),
                _ = tokio::time::sleep(self.cfg.wait_poll_interval) => {}
            }
        }
    }

    /// Cancels a queued or running deploy. Returns false when the task is
    /// unknown or already finished.
    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<bool> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(anyhow!("run_id is required"));
        }
        let reason = match reason.trim() {
            "" => "canceled by operator",
            reason => reason,
        };
        let canceled = self
            .tasks
            .cancel(run_id, reason)
            .await
            .with_context(|| format!("cancel runtime deploy task {run_id}"))?;
        if canceled {
            self.append_task_log(run_id, RECONCILE_STAGE, INFO, &format!("Task canceled: {reason}"))
                .await;
        }
        Ok(canceled)
    }

    /// Claims one task and drives it to a terminal state. Returns false when
    /// there was nothing to claim.
    pub async fn reconcile_next(
        &self,
        lease_owner: &str,
        lease_ttl: Duration,
        parent: &CancellationToken,
    ) -> Result<bool> {
        let lease_owner = lease_owner.trim();
        if lease_owner.is_empty() {
            return Err(anyhow!("runtime deploy reconciler lease owner is required"));
        }
        let lease_ttl = lease_ttl.max(MIN_LEASE_TTL);

        let Some(task) = self
            .tasks
            .claim_next(lease_owner, lease_ttl)
            .await
            .context("claim runtime deploy task")?
        else {
            return Ok(false);
        };
        let run_id = task.run_id.clone();
        tracing::info!(run_id, lease_owner, "claimed runtime deploy task");
        self.append_task_log(
            &run_id,
            RECONCILE_STAGE,
            INFO,
            &format!("Task claimed by reconciler {lease_owner}"),
        )
        .await;

        let run_token = parent.child_token();
        let stop_renew = run_token.child_token();
        let renewer =
            self.spawn_lease_renewer(&run_id, lease_owner, lease_ttl, &run_token, &stop_renew);

        let params = task.params();
        let outcome = tokio::select! {
            result = self.apply_desired_state(&params) => result,
            _ = run_token.cancelled() => Err(DeployError::Cancelled.into()),
        };
        stop_renew.cancel();
        if let Err(e) = renewer.await {
            tracing::warn!(run_id, "lease renewer ended abnormally: {e}");
        }

        let result = match outcome {
            Ok(result) => result,
            Err(err) => return self.finish_failed_run(&run_id, lease_owner, parent, err).await,
        };

        let updated = self
            .tasks
            .mark_succeeded(&run_id, lease_owner, &result)
            .await
            .with_context(|| format!("mark runtime deploy task {run_id} as succeeded"))?;
        if !updated {
            if self.is_task_canceled_now(&run_id).await {
                self.append_task_log(
                    &run_id,
                    RECONCILE_STAGE,
                    INFO,
                    "Task result ignored because task was canceled",
                )
                .await;
                return Ok(true);
            }
            return Err(DeployError::LeaseLost {
                run_id,
                outcome: "succeeded",
            }
            .into());
        }
        tracing::info!(run_id, namespace = %result.namespace, env = %result.target_env, "runtime deploy task succeeded");
        self.append_task_log(
            &run_id,
            RECONCILE_STAGE,
            INFO,
            &format!(
                "Task succeeded for namespace {} env {}",
                result.namespace, result.target_env
            ),
        )
        .await;
        Ok(true)
    }

    async fn finish_failed_run(
        &self,
        run_id: &str,
        lease_owner: &str,
        parent: &CancellationToken,
        err: anyhow::Error,
    ) -> Result<bool> {
        self.append_task_log(run_id, RECONCILE_STAGE, ERROR, &format!("Task failed: {err:#}"))
            .await;
        if is_cancelled(&err) {
            if parent.is_cancelled() {
                return Err(err);
            }
            if self.is_task_canceled_now(run_id).await {
                self.append_task_log(
                    run_id,
                    RECONCILE_STAGE,
                    INFO,
                    "Task canceled because newer deploy superseded current one",
                )
                .await;
                return Ok(true);
            }
        }

        tracing::error!(run_id, "runtime deploy task failed: {err:#}");
        let last_error = truncate_chars(format!("{err:#}").trim(), MAX_LAST_ERROR_CHARS);
        let updated = self
            .tasks
            .mark_failed(run_id, lease_owner, &last_error)
            .await
            .with_context(|| format!("mark runtime deploy task {run_id} as failed"))?;
        if !updated {
            if self.is_task_canceled_now(run_id).await {
                self.append_task_log(
                    run_id,
                    RECONCILE_STAGE,
                    INFO,
                    "Task canceled before failed mark commit",
                )
                .await;
                return Ok(true);
            }
            return Err(DeployError::LeaseLost {
                run_id: run_id.to_string(),
                outcome: "failed",
            }
            .into());
        }
        Ok(true)
    }

    /// Renews the lease every half TTL until `stop` fires. Losing the lease
    /// cancels `run`.
    fn spawn_lease_renewer(
        &self,
        run_id: &str,
        lease_owner: &str,
        lease_ttl: Duration,
        run: &CancellationToken,
        stop: &CancellationToken,
    ) -> JoinHandle<()> {
        let tasks = self.tasks.clone();
        let run_id = run_id.to_string();
        let lease_owner = lease_owner.to_string();
        let run = run.clone();
        let stop = stop.clone();
        let period = (lease_ttl / 2).clamp(MIN_RENEW_INTERVAL, MAX_RENEW_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match tasks.renew_lease(&run_id, &lease_owner, lease_ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(run_id, lease_owner, "runtime deploy task lease lost while renewing");
                        run.cancel();
                        return;
                    }
                    Err(e) => {
                        tracing::error!(run_id, lease_owner, "renew runtime deploy task lease failed: {e:#}");
                    }
                }
            }
        })
    }

    async fn is_task_canceled_now(&self, run_id: &str) -> bool {
        match self.tasks.get_by_run_id(run_id).await {
            Ok(task) => task.is_some_and(|t| t.status == TaskStatus::Canceled),
            Err(e) => {
                tracing::warn!(run_id, "load runtime deploy task status for cancellation check failed: {e:#}");
                false
            }
        }
    }

    async fn stage_failed(
        &self,
        run_id: &str,
        stage: &str,
        what: &str,
        err: anyhow::Error,
        context: &'static str,
    ) -> anyhow::Error {
        self.append_task_log(run_id, stage, ERROR, &format!("{what} failed: {err:#}"))
            .await;
        err.context(context)
    }

    fn load_stack(
        &self,
        path: &Path,
        params: &PrepareParams,
        target_env: &str,
        namespace: &str,
        vars: &TemplateVars,
    ) -> Result<LoadedStack> {
        self.stacks.load(
            path,
            LoadOptions {
                env: target_env,
                namespace,
                slot: params.slot_no,
                vars,
            },
        )
    }

    /// Runs the whole deploy of one intent: repository snapshot, stack
    /// load, prerequisites, TLS, infrastructure, image builds and services.
    pub async fn apply_desired_state(&self, params: &PrepareParams) -> Result<PrepareResult> {
        let run_id = params.run_id.trim();
        if run_id.is_empty() {
            return Err(anyhow!("run_id is required"));
        }
        self.append_task_log(run_id, PREPARE_STAGE, INFO, "Start runtime deploy applyDesiredState")
            .await;

        let mut params = params.clone();
        let mut target_env = match params.target_env.trim() {
            "" => DEFAULT_TARGET_ENV.to_string(),
            env => env.to_string(),
        };
        let mut namespace = initial_target_namespace(&params);
        let mut vars = build_template_vars(&params, &namespace);

        let repo_root = match self.resolve_run_repository_root(&params, &vars, run_id).await {
            Ok(root) => root,
            Err(e) => {
                return Err(self
                    .stage_failed(run_id, REPO_SYNC_STAGE, "Resolve repository snapshot", e, "resolve repository snapshot")
                    .await)
            }
        };
        let services_path: PathBuf = self
            .cfg
            .services_config_path(&repo_root, &params.services_yaml_path);
        let mut loaded =
            match self.load_stack(&services_path, &params, &target_env, &namespace, &vars) {
                Ok(loaded) => loaded,
                Err(e) => {
                    return Err(self
                        .stage_failed(run_id, PREPARE_STAGE, "Load services config", e, "load services config")
                        .await)
                }
            };

        if namespace.is_empty() {
            namespace = loaded.context.namespace.trim().to_string();
        }
        if namespace.is_empty() {
            return Err(anyhow!("resolved target namespace is empty"));
        }
        if !loaded.context.env.trim().is_empty() {
            target_env = loaded.context.env.trim().to_string();
            params.target_env = target_env.clone();
        }

        vars = build_template_vars(&params, &namespace);
        apply_stack_image_vars(&mut vars, &loaded.stack);
        vars.insert("CODEXK8S_PRODUCTION_NAMESPACE".to_string(), namespace.clone());
        vars.insert("CODEXK8S_WORKER_K8S_NAMESPACE".to_string(), namespace.clone());
        vars.insert(
            "CODEXK8S_REPOSITORY_ROOT".to_string(),
            repo_root.display().to_string(),
        );
        if !params.repository_full_name.trim().is_empty() {
            vars.insert(
                "CODEXK8S_GITHUB_REPO".to_string(),
                params.repository_full_name.trim().to_string(),
            );
        }
        ensure_worker_job_image(&mut vars);

        if let Ok(env) = loaded.stack.resolve_environment(&target_env) {
            let host = env.domain_template.trim();
            if !host.is_empty() {
                let base_url_unset = vars
                    .get("CODEXK8S_PUBLIC_BASE_URL")
                    .map_or(true, |v| v.trim().is_empty());
                if is_ai_env(&target_env) || base_url_unset {
                    vars.insert(
                        "CODEXK8S_PUBLIC_BASE_URL".to_string(),
                        format!("https://{host}"),
                    );
                }
                vars.insert("CODEXK8S_PUBLIC_DOMAIN".to_string(), host.to_string());
            }
        }

        if loaded.stack.project().eq_ignore_ascii_case(CODEX_K8S_PROJECT) {
            self.append_task_log(run_id, PREREQUISITES_STAGE, INFO, "Ensuring codex-k8s prerequisites")
                .await;
            if let Err(e) = self
                .ensure_codex_k8s_prerequisites(&repo_root, &namespace, &vars, run_id)
                .await
            {
                return Err(self
                    .stage_failed(run_id, PREREQUISITES_STAGE, "Ensure prerequisites", e, "ensure codex-k8s prerequisites")
                    .await);
            }
        }

        let issuer_before = issuer_flag(&vars);
        if let Err(e) = self
            .prepare_tls(&repo_root, &target_env, &namespace, &mut vars, run_id)
            .await
        {
            return Err(self
                .stage_failed(run_id, TLS_STAGE, "Prepare TLS", e, "prepare tls")
                .await);
        }
        if issuer_flag(&vars) != issuer_before {
            loaded = match self.load_stack(&services_path, &params, &target_env, &namespace, &vars) {
                Ok(loaded) => loaded,
                Err(e) => {
                    return Err(self
                        .stage_failed(
                            run_id,
                            PREPARE_STAGE,
                            "Reload services config after TLS update",
                            e,
                            "reload services config after tls update",
                        )
                        .await)
                }
            };
        }

        if let Err(e) = self
            .apply_infrastructure(&repo_root, &loaded.stack, &namespace, &vars, run_id)
            .await
        {
            return Err(self
                .stage_failed(run_id, INFRASTRUCTURE_STAGE, "Apply infrastructure", e, "apply infrastructure")
                .await);
        }

        if params.deploy_only {
            self.append_task_log(run_id, BUILD_STAGE, INFO, "Deploy-only run, skipping kaniko stage")
                .await;
        } else if let Err(e) = self
            .build_images(&repo_root, &params, &loaded.stack, &namespace, &mut vars)
            .await
        {
            return Err(self
                .stage_failed(run_id, BUILD_STAGE, "Build images", e, "build images")
                .await);
        }

        let mut applied = match self
            .apply_infrastructure(&repo_root, &loaded.stack, &namespace, &vars, run_id)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                return Err(self
                    .stage_failed(run_id, INFRASTRUCTURE_STAGE, "Re-apply infrastructure", e, "re-apply infrastructure")
                    .await)
            }
        };
        if let Err(e) = self
            .apply_services(&repo_root, &loaded.stack, &namespace, &vars, &mut applied, run_id)
            .await
        {
            return Err(self
                .stage_failed(run_id, SERVICES_STAGE, "Apply services", e, "apply services")
                .await);
        }

        if let Err(e) = self.finalize_tls(&target_env, &namespace, &vars, run_id).await {
            return Err(self
                .stage_failed(run_id, TLS_STAGE, "Finalize TLS", e, "finalize tls")
                .await);
        }

        self.append_task_log(run_id, PREPARE_STAGE, INFO, "Runtime deploy finished successfully")
            .await;
        Ok(PrepareResult {
            namespace,
            target_env,
        })
    }
}

fn issuer_flag(vars: &TemplateVars) -> String {
    vars.get(CERT_ISSUER_ENABLED_VAR)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}
