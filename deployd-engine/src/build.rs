use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use deployd_common::{
    kube::SecretData,
    utils::{kube_name, random_hex, sanitize_image_tag, sanitize_name_token, trim_log_for_error},
    PrepareParams, TemplateVars, DEFAULT_BUILD_REF,
};
use futures::{stream, StreamExt, TryStreamExt};

use crate::{
    image_vars::apply_built_image_result,
    registry::{has_tag, repository_path},
    render::{render_placeholders, value_or},
    service::{DeployService, ERROR, INFO, WARNING},
    stack::{Image, Stack},
};

pub const GIT_TOKEN_SECRET_NAME: &str = "codex-k8s-git-token";
pub const KANIKO_TEMPLATE_PATH: &str = "deploy/base/kaniko/kaniko-build-job.yaml.tpl";
pub const MIRROR_TEMPLATE_PATH: &str = "deploy/base/kaniko/mirror-image-job.yaml.tpl";
pub const CODEGEN_CHECK_TEMPLATE_PATH: &str = "deploy/base/codex-k8s/codegen-check-job.yaml.tpl";

const BUILD_STAGE: &str = "build";
const MIRROR_STAGE: &str = "mirror";
const CODEGEN_CHECK_STAGE: &str = "codegen-check";
const CLEANUP_STAGE: &str = "cleanup";

const CODEX_K8S_PROJECT: &str = "codex-k8s";
const INTERNAL_REGISTRY_HOST_VAR: &str = "CODEXK8S_INTERNAL_REGISTRY_HOST";
const DEFAULT_MIRROR_TOOL_IMAGE: &str = "gcr.io/go-containerregistry/crane:debug";

/// An external image the platform pulls through the internal registry.
struct MirrorItem {
    var_key: &'static str,
    source: &'static str,
    target_path: &'static str,
    target_tag: &'static str,
}

static MIRROR_ITEMS: [MirrorItem; 6] = [
    MirrorItem {
        var_key: "CODEXK8S_KANIKO_CLONE_IMAGE",
        source: "alpine/git:2.47.2",
        target_path: "codex-k8s/mirror/alpine-git",
        target_tag: "2.47.2",
    },
    MirrorItem {
        var_key: "CODEXK8S_KANIKO_EXECUTOR_IMAGE",
        source: "gcr.io/kaniko-project/executor:v1.23.2-debug",
        target_path: "codex-k8s/mirror/kaniko-executor",
        target_tag: "v1.23.2-debug",
    },
    MirrorItem {
        var_key: "CODEXK8S_BUSYBOX_IMAGE",
        source: "busybox:1.36",
        target_path: "codex-k8s/mirror/busybox",
        target_tag: "1.36",
    },
    MirrorItem {
        var_key: "CODEXK8S_POSTGRES_IMAGE",
        source: "pgvector/pgvector:pg16",
        target_path: "codex-k8s/mirror/pgvector",
        target_tag: "pg16",
    },
    MirrorItem {
        var_key: "CODEXK8S_OAUTH2_PROXY_IMAGE",
        source: "quay.io/oauth2-proxy/oauth2-proxy:v7.6.0",
        target_path: "codex-k8s/mirror/oauth2-proxy",
        target_tag: "v7.6.0",
    },
    MirrorItem {
        var_key: "CODEXK8S_CODEGEN_CHECK_IMAGE",
        source: "golang:1.24-bookworm",
        target_path: "codex-k8s/mirror/golang",
        target_tag: "1.24-bookworm",
    },
];

/// Everything one Kaniko job needs, shared by all images of a run.
struct BuildRun {
    namespace: String,
    repository_full_name: String,
    build_ref: String,
    run_token: String,
    run_id: String,
    template_path: String,
    template: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub name: String,
    pub image_ref: String,
    pub repository: String,
}

impl DeployService {
    /// Builds every `type: build` image of the stack with one Kaniko job each
    /// and publishes the resulting references into `vars`.
    ///
    /// External images are mirrored into the internal registry first and the
    /// codegen check runs for the platform project. Stale tags of the built
    /// repositories are pruned afterwards.
    pub async fn build_images(
        &self,
        repo_root: &Path,
        params: &PrepareParams,
        stack: &Stack,
        namespace: &str,
        vars: &mut TemplateVars,
    ) -> Result<Vec<BuiltImage>> {
        let run_id = params.run_id.trim();
        let mut entries: Vec<(String, Image)> = stack
            .spec
            .images
            .iter()
            .filter(|(_, image)| image.is_build())
            .map(|(name, image)| (name.trim().to_string(), image.clone()))
            .collect();
        if entries.is_empty() {
            self.append_task_log(
                run_id,
                BUILD_STAGE,
                INFO,
                "No build images configured, skipping kaniko stage",
            )
            .await;
            return Ok(vec![]);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let github_pat = match self.cfg.github_pat.trim() {
            "" => value_or(vars, "CODEXK8S_GITHUB_PAT", ""),
            pat => pat.to_string(),
        };
        if github_pat.is_empty() {
            return Err(anyhow!(
                "CODEXK8S_GITHUB_PAT is required for kaniko build jobs"
            ));
        }
        let repository_full_name = match params.repository_full_name.trim() {
            "" => value_or(vars, "CODEXK8S_GITHUB_REPO", ""),
            repo => repo.to_string(),
        };
        if repository_full_name.is_empty() {
            return Err(anyhow!(
                "repository_full_name is required for kaniko build jobs"
            ));
        }
        let build_ref = [
            params.build_ref.trim().to_string(),
            value_or(vars, "CODEXK8S_BUILD_REF", ""),
            value_or(vars, "CODEXK8S_AGENT_BASE_BRANCH", ""),
        ]
        .into_iter()
        .find(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_BUILD_REF.to_string());
        vars.insert("CODEXK8S_BUILD_REF".to_string(), build_ref.clone());

        let run_token = match sanitize_name_token(run_id, 12) {
            token if token.is_empty() => random_hex(6),
            token => token,
        };

        self.kube
            .upsert_secret(namespace, GIT_TOKEN_SECRET_NAME, git_token_secret(&github_pat))
            .await
            .with_context(|| format!("upsert {GIT_TOKEN_SECRET_NAME} secret"))?;

        let template_path = repo_root.join(KANIKO_TEMPLATE_PATH);
        let template = tokio::fs::read_to_string(&template_path)
            .await
            .with_context(|| format!("read kaniko template {}", template_path.display()))?;

        let mirror_path = repo_root.join(MIRROR_TEMPLATE_PATH);
        if let Ok(mirror_template) = tokio::fs::read_to_string(&mirror_path).await {
            self.mirror_external_dependencies(
                namespace,
                vars,
                run_id,
                &mirror_path.display().to_string(),
                &mirror_template,
            )
            .await
            .context("mirror external dependencies")?;
        }

        let run = Arc::new(BuildRun {
            namespace: namespace.to_string(),
            repository_full_name,
            build_ref,
            run_token,
            run_id: run_id.to_string(),
            template_path: template_path.display().to_string(),
            template,
        });

        if should_run_codegen_check(stack, vars) {
            let path = repo_root.join(CODEGEN_CHECK_TEMPLATE_PATH);
            let template = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read codegen check template {}", path.display()))?;
            self.run_codegen_check(&run, vars, &path.display().to_string(), &template)
                .await?;
        }

        let max_parallel =
            parse_positive_int(vars.get("CODEXK8S_KANIKO_MAX_PARALLEL").map(String::as_str), 1)
                .min(entries.len());
        let shared_vars = Arc::new(vars.clone());
        let mut built: Vec<BuiltImage> = stream::iter(entries)
            .map(|(name, image)| {
                let svc = self.clone();
                let run = run.clone();
                let vars = shared_vars.clone();
                async move { svc.run_kaniko_build(&run, &name, &image, &vars).await }
            })
            .buffer_unordered(max_parallel)
            .try_collect()
            .await?;

        built.sort_by(|a, b| a.name.cmp(&b.name));
        for image in &built {
            apply_built_image_result(vars, &image.name, &image.image_ref);
        }
        let repositories: BTreeSet<String> = built
            .iter()
            .map(|image| image.repository.clone())
            .filter(|repository| !repository.is_empty())
            .collect();
        self.cleanup_built_image_repositories(vars, run_id, &repositories)
            .await;
        Ok(built)
    }

    async fn run_kaniko_build(
        &self,
        run: &BuildRun,
        name: &str,
        image: &Image,
        vars: &TemplateVars,
    ) -> Result<BuiltImage> {
        self.append_task_log(&run.run_id, BUILD_STAGE, INFO, &format!("Build image {name} started"))
            .await;
        let repository = image.repository.trim();
        if repository.is_empty() {
            return Err(anyhow!(
                "image {name:?} repository is required for build type"
            ));
        }
        let tag = match sanitize_image_tag(&image.tag_template) {
            tag if tag.is_empty() => "latest".to_string(),
            tag => tag,
        };
        let destination_latest = format!("{repository}:latest");
        let destination_tagged = format!("{repository}:{tag}");
        let context = resolve_kaniko_context(&image.context);
        let dockerfile = resolve_kaniko_dockerfile(&image.dockerfile)
            .with_context(|| format!("image {name:?}"))?;
        let job_name = kube_name(&format!(
            "codex-k8s-kaniko-{}-{}",
            sanitize_name_token(name, 24),
            run.run_token
        ));

        let mut job_vars = vars.clone();
        job_vars.extend(
            [
                ("CODEXK8S_STAGING_NAMESPACE", run.namespace.clone()),
                ("CODEXK8S_GITHUB_REPO", run.repository_full_name.clone()),
                ("CODEXK8S_BUILD_REF", run.build_ref.clone()),
                ("CODEXK8S_KANIKO_JOB_NAME", job_name.clone()),
                ("CODEXK8S_KANIKO_COMPONENT", sanitize_name_token(name, 30)),
                ("CODEXK8S_KANIKO_CONTEXT", context),
                ("CODEXK8S_KANIKO_DOCKERFILE", dockerfile),
                ("CODEXK8S_KANIKO_DESTINATION_LATEST", destination_latest),
                ("CODEXK8S_KANIKO_DESTINATION_SHA", destination_tagged.clone()),
            ]
            .map(|(k, v)| (k.to_string(), v)),
        );

        let rendered = render_placeholders(&run.template, &job_vars).with_context(|| {
            format!(
                "render kaniko job template {} for image {name}",
                run.template_path
            )
        })?;
        self.replace_job(&run.namespace, &job_name, &rendered, "kaniko")
            .await?;

        if let Err(e) = self
            .kube
            .wait_for_job_complete(&run.namespace, &job_name, self.cfg.kaniko_timeout)
            .await
        {
            let Some(logs) = self.job_logs(&run.namespace, &job_name).await else {
                return Err(e).with_context(|| format!("wait kaniko job {job_name}"));
            };
            self.append_task_log(
                &run.run_id,
                BUILD_STAGE,
                ERROR,
                &format!("Build image {name} failed logs:\n{logs}"),
            )
            .await;
            return Err(anyhow!(
                "wait kaniko job {job_name}: {e:#}; logs: {}",
                trim_log_for_error(&logs)
            ));
        }

        if let Some(logs) = self.job_logs(&run.namespace, &job_name).await {
            self.append_task_log(
                &run.run_id,
                BUILD_STAGE,
                INFO,
                &format!("Build image {name} logs:\n{logs}"),
            )
            .await;
        }
        self.append_task_log(
            &run.run_id,
            BUILD_STAGE,
            INFO,
            &format!("Build image {name} finished: {destination_tagged}"),
        )
        .await;

        Ok(BuiltImage {
            name: name.to_string(),
            image_ref: destination_tagged,
            repository: repository.to_string(),
        })
    }

    /// Points the platform image variables at internal registry copies,
    /// running a copy job for every copy the registry doesn't hold yet.
    async fn mirror_external_dependencies(
        &self,
        namespace: &str,
        vars: &mut TemplateVars,
        run_id: &str,
        template_path: &str,
        template: &str,
    ) -> Result<()> {
        let enabled = match vars
            .get("CODEXK8S_IMAGE_MIRROR_ENABLED")
            .map(|v| v.trim())
            .unwrap_or_default()
        {
            "" => true,
            raw => parse_bool_flag(raw).unwrap_or(false),
        };
        if !enabled {
            return Ok(());
        }
        let Some(registry) = self.registry.clone() else {
            self.append_task_log(
                run_id,
                MIRROR_STAGE,
                WARNING,
                "Registry client is not configured, skipping external image mirror",
            )
            .await;
            return Ok(());
        };
        let internal_host = vars
            .get(INTERNAL_REGISTRY_HOST_VAR)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if internal_host.is_empty() {
            return Ok(());
        }
        let tool_image = value_or(vars, "CODEXK8S_IMAGE_MIRROR_TOOL_IMAGE", DEFAULT_MIRROR_TOOL_IMAGE);
        let job_token = random_hex(4);

        for item in &MIRROR_ITEMS {
            let current = vars
                .get(item.var_key)
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            let target = format!("{internal_host}/{}:{}", item.target_path, item.target_tag);
            vars.insert(item.var_key.to_string(), target.clone());

            match registry.list_tags(item.target_path).await {
                Ok(tags) if has_tag(&tags, item.target_tag) => {
                    self.append_task_log(
                        run_id,
                        MIRROR_STAGE,
                        INFO,
                        &format!("Mirror already exists: {target}"),
                    )
                    .await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(repository = item.target_path, "list mirror tags failed: {e:#}");
                }
            }

            let source = if !current.is_empty() && !current.starts_with(&format!("{internal_host}/")) {
                current
            } else {
                item.source.to_string()
            };
            let job_name = kube_name(&format!(
                "codex-k8s-mirror-{}-{job_token}",
                sanitize_name_token(item.var_key, 20)
            ));
            let mut job_vars = vars.clone();
            job_vars.extend(
                [
                    ("CODEXK8S_PRODUCTION_NAMESPACE", namespace.to_string()),
                    ("CODEXK8S_IMAGE_MIRROR_JOB_NAME", job_name.clone()),
                    ("CODEXK8S_IMAGE_MIRROR_SOURCE", source.clone()),
                    ("CODEXK8S_IMAGE_MIRROR_TARGET", target.clone()),
                    ("CODEXK8S_IMAGE_MIRROR_TOOL_IMAGE", tool_image.clone()),
                ]
                .map(|(k, v)| (k.to_string(), v)),
            );
            let rendered = render_placeholders(template, &job_vars).with_context(|| {
                format!("render mirror job {template_path} for {}", item.var_key)
            })?;
            self.replace_job(namespace, &job_name, &rendered, "mirror")
                .await?;
            if let Err(e) = self
                .kube
                .wait_for_job_complete(namespace, &job_name, self.cfg.kaniko_timeout)
                .await
            {
                if let Some(logs) = self.job_logs(namespace, &job_name).await {
                    self.append_task_log(
                        run_id,
                        MIRROR_STAGE,
                        ERROR,
                        &format!("Mirror failed for {target}:\n{logs}"),
                    )
                    .await;
                }
                return Err(e).with_context(|| format!("wait mirror job {job_name}"));
            }
            self.append_task_log(
                run_id,
                MIRROR_STAGE,
                INFO,
                &format!("Mirrored {source} -> {target}"),
            )
            .await;
        }
        Ok(())
    }

    async fn run_codegen_check(
        &self,
        run: &BuildRun,
        vars: &TemplateVars,
        template_path: &str,
        template: &str,
    ) -> Result<()> {
        let job_name = kube_name(&format!(
            "codex-k8s-codegen-check-{}",
            sanitize_name_token(&run.run_token, 20)
        ));
        let mut job_vars = vars.clone();
        job_vars.extend(
            [
                ("CODEXK8S_PRODUCTION_NAMESPACE", run.namespace.clone()),
                ("CODEXK8S_CODEGEN_CHECK_JOB_NAME", job_name.clone()),
                ("CODEXK8S_GITHUB_REPO", run.repository_full_name.clone()),
                ("CODEXK8S_BUILD_REF", run.build_ref.clone()),
            ]
            .map(|(k, v)| (k.to_string(), v)),
        );
        let rendered = render_placeholders(template, &job_vars)
            .with_context(|| format!("render codegen check job {template_path}"))?;

        self.append_task_log(&run.run_id, CODEGEN_CHECK_STAGE, INFO, "Codegen check started")
            .await;
        self.replace_job(&run.namespace, &job_name, &rendered, "codegen check")
            .await?;

        let timeout = vars
            .get("CODEXK8S_CODEGEN_CHECK_TIMEOUT")
            .and_then(|raw| parse_go_duration(raw))
            .filter(|d| !d.is_zero())
            .unwrap_or(self.cfg.kaniko_timeout);
        if let Err(e) = self
            .kube
            .wait_for_job_complete(&run.namespace, &job_name, timeout)
            .await
        {
            let Some(logs) = self.job_logs(&run.namespace, &job_name).await else {
                return Err(e).with_context(|| format!("wait codegen check job {job_name}"));
            };
            self.append_task_log(
                &run.run_id,
                CODEGEN_CHECK_STAGE,
                ERROR,
                &format!("Codegen check failed logs:\n{logs}"),
            )
            .await;
            return Err(anyhow!(
                "wait codegen check job {job_name}: {e:#}; logs: {}",
                trim_log_for_error(&logs)
            ));
        }

        if let Some(logs) = self.job_logs(&run.namespace, &job_name).await {
            self.append_task_log(
                &run.run_id,
                CODEGEN_CHECK_STAGE,
                INFO,
                &format!("Codegen check logs:\n{logs}"),
            )
            .await;
        }
        self.append_task_log(&run.run_id, CODEGEN_CHECK_STAGE, INFO, "Codegen check finished")
            .await;
        Ok(())
    }

    /// Keeps the newest tags of every built internal repository and deletes
    /// the rest. Registry errors only end up in the task log.
    async fn cleanup_built_image_repositories(
        &self,
        vars: &TemplateVars,
        run_id: &str,
        repositories: &BTreeSet<String>,
    ) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        let keep = parse_positive_int(
            vars.get("CODEXK8S_REGISTRY_CLEANUP_KEEP_TAGS").map(String::as_str),
            self.cfg.registry_cleanup_keep_tags,
        );
        let internal_host = vars
            .get(INTERNAL_REGISTRY_HOST_VAR)
            .map(|v| v.trim())
            .unwrap_or_default();

        for repository in repositories {
            let repo_path = repository_path(repository, internal_host);
            if repo_path.is_empty() {
                continue;
            }
            let tags = match registry.list_tags(&repo_path).await {
                Ok(tags) => tags,
                Err(e) => {
                    self.append_task_log(
                        run_id,
                        CLEANUP_STAGE,
                        WARNING,
                        &format!("List tags failed for {repo_path}: {e:#}"),
                    )
                    .await;
                    continue;
                }
            };
            for stale in tags.iter().skip(keep) {
                let tag = stale.tag.trim();
                if tag.is_empty() {
                    continue;
                }
                match registry.delete_tag(&repo_path, tag).await {
                    Ok(_) => {
                        self.append_task_log(
                            run_id,
                            CLEANUP_STAGE,
                            INFO,
                            &format!("Deleted stale tag {repo_path}:{tag}"),
                        )
                        .await;
                    }
                    Err(e) => {
                        self.append_task_log(
                            run_id,
                            CLEANUP_STAGE,
                            WARNING,
                            &format!("Delete stale tag failed for {repo_path}:{tag}: {e:#}"),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Removes a previous job of the same name and applies `manifest`.
    async fn replace_job(
        &self,
        namespace: &str,
        job_name: &str,
        manifest: &str,
        what: &str,
    ) -> Result<()> {
        self.kube
            .delete_job_if_exists(namespace, job_name)
            .await
            .with_context(|| format!("delete previous {what} job {job_name}"))?;
        self.kube
            .apply_manifest(manifest.as_bytes(), namespace, &self.cfg.field_manager)
            .await
            .with_context(|| format!("apply {what} job {job_name}"))?;
        Ok(())
    }

    /// Tail of the job logs, `None` when empty or unavailable.
    async fn job_logs(&self, namespace: &str, job_name: &str) -> Option<String> {
        match self
            .kube
            .get_job_logs(namespace, job_name, self.cfg.kaniko_job_log_tail_lines)
            .await
        {
            Ok(logs) if !logs.trim().is_empty() => Some(logs),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(job = %job_name, "fetch job logs failed: {e:#}");
                None
            }
        }
    }
}

pub(crate) fn git_token_secret(token: &str) -> SecretData {
    [("token".to_string(), token.as_bytes().to_vec())]
        .into_iter()
        .collect()
}

fn should_run_codegen_check(stack: &Stack, vars: &TemplateVars) -> bool {
    if !stack.project().eq_ignore_ascii_case(CODEX_K8S_PROJECT) {
        return false;
    }
    match vars
        .get("CODEXK8S_CODEGEN_CHECK_ENABLED")
        .map(|v| v.trim())
        .unwrap_or_default()
    {
        "" => true,
        raw => parse_bool_flag(raw).unwrap_or(true),
    }
}

/// `1/t/true` and `0/f/false` in any case.
fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// Durations such as `90s`, `15m` or `1h30m`.
fn parse_go_duration(raw: &str) -> Option<Duration> {
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        nanos += value * scale;
        rest = &rest[unit_len..];
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

/// Kaniko build context inside the cloned workspace.
pub fn resolve_kaniko_context(path: &str) -> String {
    match path.trim() {
        "" | "." => "dir:///workspace".to_string(),
        path if path.starts_with("dir://") => path.to_string(),
        path => format!(
            "dir:///workspace/{}",
            path.strip_prefix("./").unwrap_or(path)
        ),
    }
}

pub fn resolve_kaniko_dockerfile(path: &str) -> Result<String> {
    match path.trim() {
        "" => Err(anyhow!("dockerfile is required for build image")),
        path if path.starts_with('/') => Ok(path.to_string()),
        path => Ok(format!(
            "/workspace/{}",
            path.strip_prefix("./").unwrap_or(path)
        )),
    }
}

pub fn parse_positive_int(raw: Option<&str>, fallback: usize) -> usize {
    raw.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}
