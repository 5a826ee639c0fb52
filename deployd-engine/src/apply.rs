use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use deployd_common::{
    kube::AppliedResourceRef, manifest::parse_manifest_refs, TemplateVars,
};

use crate::{
    planner::{build_service_group_order, evaluate_when, order_group, topo_sort_infrastructure},
    render::render_placeholders,
    service::{DeployService, ERROR, INFO},
    stack::{InfrastructureItem, ManifestRef, Service, ServiceScope, Stack},
};

const APPLY_STAGE: &str = "apply";

impl DeployService {
    /// Applies the enabled infrastructure items in dependency order and
    /// returns the names applied.
    pub async fn apply_infrastructure(
        &self,
        repo_root: &Path,
        stack: &Stack,
        namespace: &str,
        vars: &TemplateVars,
        run_id: &str,
    ) -> Result<HashSet<String>> {
        let mut enabled = BTreeMap::<String, InfrastructureItem>::new();
        for item in &stack.spec.infrastructure {
            let name = item.name.trim();
            if name.is_empty() {
                return Err(anyhow!("infrastructure item name is required"));
            }
            let include = evaluate_when(&item.when)
                .with_context(|| format!("infrastructure {name:?} when expression"))?;
            if include {
                enabled.insert(name.to_string(), item.clone());
            }
        }

        let order = topo_sort_infrastructure(&enabled)?;
        let mut applied = HashSet::with_capacity(order.len());
        for name in order {
            let item = &enabled[&name];
            self.apply_unit(repo_root, &name, &item.manifests, namespace, vars, run_id)
                .await?;
            applied.insert(name);
        }
        Ok(applied)
    }

    /// Applies the enabled services group by group. `applied` holds the
    /// infrastructure already in place and grows with every service.
    pub async fn apply_services(
        &self,
        repo_root: &Path,
        stack: &Stack,
        namespace: &str,
        vars: &TemplateVars,
        applied: &mut HashSet<String>,
        run_id: &str,
    ) -> Result<()> {
        let mut enabled = BTreeMap::<String, Service>::new();
        let mut groups = BTreeMap::<String, Vec<String>>::new();
        for service in &stack.spec.services {
            let name = service.name.trim();
            if name.is_empty() {
                return Err(anyhow!("service name is required"));
            }
            if let Err(reason) = should_apply_service_scope(service.scope, namespace, vars) {
                self.append_task_log(run_id, APPLY_STAGE, INFO, &format!("Skip unit {name}: {reason}"))
                    .await;
                continue;
            }
            let include = evaluate_when(&service.when)
                .with_context(|| format!("service {name:?} when expression"))?;
            if !include {
                continue;
            }
            enabled.insert(name.to_string(), service.clone());
            groups
                .entry(service.deploy_group.trim().to_string())
                .or_default()
                .push(name.to_string());
        }
        if enabled.is_empty() {
            return Ok(());
        }

        for group in build_service_group_order(&stack.spec.orchestration.deploy_order, &groups) {
            let names = &groups[&group];
            for name in order_group(&group, names, &enabled, applied)? {
                let service = &enabled[&name];
                self.apply_unit(repo_root, &name, &service.manifests, namespace, vars, run_id)
                    .await?;
                applied.insert(name);
            }
        }
        Ok(())
    }

    /// Renders, applies and waits for every manifest of one unit.
    pub async fn apply_unit(
        &self,
        repo_root: &Path,
        unit: &str,
        manifests: &[ManifestRef],
        namespace: &str,
        vars: &TemplateVars,
        run_id: &str,
    ) -> Result<Vec<AppliedResourceRef>> {
        self.append_task_log(run_id, APPLY_STAGE, INFO, &format!("Apply unit {unit} started"))
            .await;
        let repo_root = if repo_root.as_os_str().is_empty() {
            self.cfg.repository_root.as_path()
        } else {
            repo_root
        };

        let mut all_refs = Vec::new();
        for manifest in manifests {
            let path = manifest.path.trim();
            if path.is_empty() {
                continue;
            }
            let full_path = repo_root.join(path);
            let display = full_path.display();

            let raw = match tokio::fs::read_to_string(&full_path).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.apply_failed(run_id, &format!("Read manifest failed for {unit}: {display}"))
                        .await;
                    return Err(e).with_context(|| format!("read manifest {display} for {unit}"));
                }
            };
            let rendered = match render_placeholders(&raw, vars) {
                Ok(rendered) => rendered,
                Err(e) => {
                    self.apply_failed(run_id, &format!("Render manifest failed for {unit}: {display}"))
                        .await;
                    return Err(e)
                        .with_context(|| format!("render manifest template {display} for {unit}"));
                }
            };
            let refs = match parse_manifest_refs(rendered.as_bytes(), namespace) {
                Ok(refs) => refs,
                Err(e) => {
                    self.apply_failed(
                        run_id,
                        &format!("Parse manifest refs failed for {unit}: {display}"),
                    )
                    .await;
                    return Err(e)
                        .with_context(|| format!("parse manifest refs {display} for {unit}"));
                }
            };

            for job in refs.iter().filter(|r| r.kind.eq_ignore_ascii_case("job")) {
                let job_namespace = match job.namespace.trim() {
                    "" => namespace.trim(),
                    ns => ns,
                };
                if job_namespace.is_empty() {
                    continue;
                }
                if let Err(e) = self.kube.delete_job_if_exists(job_namespace, &job.name).await {
                    self.apply_failed(
                        run_id,
                        &format!("Delete existing job failed for {unit}: {}", job.name),
                    )
                    .await;
                    return Err(e).with_context(|| {
                        format!(
                            "delete previous job {job_namespace}/{} before apply",
                            job.name
                        )
                    });
                }
            }

            let applied = match self
                .kube
                .apply_manifest(rendered.as_bytes(), namespace, &self.cfg.field_manager)
                .await
            {
                Ok(applied) => applied,
                Err(e) => {
                    self.apply_failed(run_id, &format!("Apply manifest failed for {unit}: {display}"))
                        .await;
                    return Err(e).with_context(|| format!("apply manifest {display} for {unit}"));
                }
            };
            for resource in &applied {
                if let Err(e) = self.wait_applied_resource(resource, namespace).await {
                    self.apply_failed(
                        run_id,
                        &format!(
                            "Wait resource failed for {unit}: {}/{}",
                            resource.kind, resource.name
                        ),
                    )
                    .await;
                    return Err(e).with_context(|| {
                        format!(
                            "wait applied resource {}/{} for {unit}",
                            resource.kind, resource.name
                        )
                    });
                }
            }
            all_refs.extend(applied);
        }

        self.append_task_log(run_id, APPLY_STAGE, INFO, &format!("Apply unit {unit} finished"))
            .await;
        Ok(all_refs)
    }

    async fn apply_failed(&self, run_id: &str, message: &str) {
        self.append_task_log(run_id, APPLY_STAGE, ERROR, message).await;
    }

    /// Waits for workload kinds to become ready. Other kinds are done once applied.
    pub async fn wait_applied_resource(
        &self,
        resource: &AppliedResourceRef,
        fallback_namespace: &str,
    ) -> Result<()> {
        let namespace = match resource.namespace.trim() {
            "" => fallback_namespace.trim(),
            ns => ns,
        };
        let name = resource.name.trim();
        if namespace.is_empty() || name.is_empty() {
            return Ok(());
        }
        let timeout = self.cfg.rollout_timeout;
        match resource.kind.trim().to_lowercase().as_str() {
            "deployment" => {
                self.kube
                    .wait_for_deployment_ready(namespace, name, timeout)
                    .await
            }
            "statefulset" => {
                self.kube
                    .wait_for_stateful_set_ready(namespace, name, timeout)
                    .await
            }
            "daemonset" => {
                self.kube
                    .wait_for_daemon_set_ready(namespace, name, timeout)
                    .await
            }
            "job" => self.kube.wait_for_job_complete(namespace, name, timeout).await,
            _ => Ok(()),
        }
    }
}

/// Whether a service of `scope` belongs in `namespace`. The error carries
/// the reason it was skipped.
pub fn should_apply_service_scope(
    scope: ServiceScope,
    namespace: &str,
    vars: &TemplateVars,
) -> Result<(), String> {
    if scope != ServiceScope::InfrastructureSingleton {
        return Ok(());
    }
    let var = |key: &str| vars.get(key).map(|v| v.trim()).unwrap_or("");

    let env = match var("CODEXK8S_ENV") {
        "" => var("CODEXK8S_SERVICES_CONFIG_ENV"),
        env => env,
    }
    .to_lowercase();
    if !matches!(env.as_str(), "" | "production" | "prod") {
        return Err(
            "service scope=infrastructure-singleton applies only in production environment"
                .to_string(),
        );
    }

    let platform_namespace = match var("CODEXK8S_PLATFORM_NAMESPACE") {
        "" => var("CODEXK8S_PRODUCTION_NAMESPACE"),
        ns => ns,
    };
    let namespace = namespace.trim();
    if !platform_namespace.is_empty() && !namespace.is_empty() && namespace != platform_namespace
    {
        return Err(format!(
            "service scope=infrastructure-singleton applies only in platform namespace {platform_namespace}"
        ));
    }
    Ok(())
}
