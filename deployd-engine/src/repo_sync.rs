use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use deployd_common::{
    utils::{kube_name, random_hex, sanitize_name_token, trim_log_for_error},
    PrepareParams, TemplateVars,
};

use crate::{
    build::{git_token_secret, GIT_TOKEN_SECRET_NAME},
    build_ref::{is_immutable_git_ref, resolve_runtime_build_ref},
    render::{render_placeholders, value_or},
    service::{DeployService, ERROR, INFO},
    template_vars::is_ai_env,
};

pub const REPO_CACHE_PVC_NAME: &str = "codex-k8s-repo-cache";

const REPO_CACHE_PVC_TEMPLATE: &str = include_str!("../assets/repo-cache-pvc.yaml.tpl");
const REPO_SYNC_JOB_TEMPLATE: &str = include_str!("../assets/repo-sync-job.yaml.tpl");
const DEFAULT_REPO_CACHE_STORAGE_SIZE: &str = "20Gi";

/// Whether `root` already holds a checked out repository.
pub fn looks_like_repository_root(root: &Path) -> bool {
    if root.as_os_str().is_empty() {
        return false;
    }
    root.join("deploy").join("base").is_dir() || root.join("services.yaml").exists()
}

/// Where the snapshot of `owner/name` at `build_ref` lives under the cache
/// root. `ai` slots share the cache root itself.
pub fn repo_snapshot_path(
    cache_root: &Path,
    target_env: &str,
    owner: &str,
    name: &str,
    build_ref: &str,
) -> PathBuf {
    if is_ai_env(target_env) {
        return cache_root.to_path_buf();
    }
    let ref_token = match sanitize_name_token(build_ref, 120) {
        token if token.is_empty() => "main".to_string(),
        token => token,
    };
    cache_root
        .join("github")
        .join(owner)
        .join(name)
        .join(ref_token)
}

fn split_repository(full_name: &str) -> Option<(&str, &str)> {
    let (owner, name) = full_name.split_once('/')?;
    let (owner, name) = (owner.trim(), name.trim());
    (!owner.is_empty() && !name.is_empty()).then_some((owner, name))
}

impl DeployService {
    /// Repository checkout the run reads manifests and templates from.
    ///
    /// A configured root that is empty, relative, or already a working tree
    /// is used as is. Otherwise a snapshot of the run's repository and ref
    /// is synced into the repo cache volume by a one-shot job.
    pub async fn resolve_run_repository_root(
        &self,
        params: &PrepareParams,
        vars: &TemplateVars,
        run_id: &str,
    ) -> Result<PathBuf> {
        let configured = self.cfg.repository_root.clone();
        if configured.as_os_str().is_empty()
            || looks_like_repository_root(&configured)
            || !configured.is_absolute()
        {
            return Ok(configured);
        }

        let repository_full_name = match params.repository_full_name.trim() {
            "" => value_or(vars, "CODEXK8S_GITHUB_REPO", ""),
            repo => repo.to_string(),
        };
        if repository_full_name.is_empty() {
            return Err(anyhow!(
                "repository_full_name is required to resolve repository snapshot"
            ));
        }
        let (owner, name) = split_repository(&repository_full_name).ok_or_else(|| {
            anyhow!("repository_full_name must be in owner/name form, got {repository_full_name:?}")
        })?;

        let build_ref = resolve_runtime_build_ref([
            params.build_ref.as_str(),
            value_or(vars, "CODEXK8S_BUILD_REF", "").as_str(),
            value_or(vars, "CODEXK8S_AGENT_BASE_BRANCH", "").as_str(),
        ]);

        let sync_namespace = [
            params.namespace.trim().to_string(),
            value_or(vars, "CODEXK8S_PRODUCTION_NAMESPACE", ""),
            value_or(vars, "CODEXK8S_PLATFORM_NAMESPACE", ""),
        ]
        .into_iter()
        .find(|ns| !ns.is_empty())
        .ok_or_else(|| anyhow!("target namespace is required for repo sync"))?;

        let repo_root = repo_snapshot_path(&configured, &params.target_env, owner, name, &build_ref);
        if repo_root.join(".git").exists()
            && is_immutable_git_ref(&build_ref)
            && !is_ai_env(&params.target_env)
        {
            tracing::debug!(run_id, path = %repo_root.display(), "reusing immutable repository snapshot");
            return Ok(repo_root);
        }

        self.ensure_repo_cache_pvc(&sync_namespace, vars, run_id)
            .await?;
        self.ensure_repo_snapshot(
            &sync_namespace,
            &repository_full_name,
            &build_ref,
            &repo_root,
            vars,
            run_id,
        )
        .await?;

        if !repo_root.join(".git").exists() {
            return Err(anyhow!(
                "repo snapshot is missing after repo sync: {}",
                repo_root.display()
            ));
        }
        Ok(repo_root)
    }

    async fn ensure_repo_cache_pvc(
        &self,
        namespace: &str,
        vars: &TemplateVars,
        run_id: &str,
    ) -> Result<()> {
        let mut render_vars = vars.clone();
        render_vars.insert("CODEXK8S_PRODUCTION_NAMESPACE".to_string(), namespace.to_string());
        render_vars.insert("CODEXK8S_PLATFORM_NAMESPACE".to_string(), namespace.to_string());
        render_vars.insert(
            "CODEXK8S_REPO_CACHE_STORAGE_SIZE".to_string(),
            value_or(vars, "CODEXK8S_REPO_CACHE_STORAGE_SIZE", DEFAULT_REPO_CACHE_STORAGE_SIZE),
        );

        let rendered = render_placeholders(REPO_CACHE_PVC_TEMPLATE, &render_vars)
            .context("render repo cache pvc manifest")?;
        self.kube
            .apply_manifest(rendered.as_bytes(), namespace, &self.cfg.field_manager)
            .await
            .context("apply repo cache pvc manifest")?;
        self.append_task_log(
            run_id,
            "repo-cache",
            INFO,
            &format!("Repo cache PVC ensured in namespace {namespace}"),
        )
        .await;
        Ok(())
    }

    async fn ensure_repo_snapshot(
        &self,
        namespace: &str,
        repository_full_name: &str,
        build_ref: &str,
        repo_root: &Path,
        vars: &TemplateVars,
        run_id: &str,
    ) -> Result<()> {
        let token = match self.cfg.github_pat.trim() {
            "" => value_or(vars, "CODEXK8S_GITHUB_PAT", ""),
            pat => pat.to_string(),
        };
        if token.is_empty() {
            return Err(anyhow!("CODEXK8S_GITHUB_PAT is required for repo sync"));
        }
        self.kube
            .upsert_secret(namespace, GIT_TOKEN_SECRET_NAME, git_token_secret(&token))
            .await
            .with_context(|| format!("upsert {GIT_TOKEN_SECRET_NAME} secret"))?;

        let run_token = match sanitize_name_token(run_id, 12) {
            token if token.is_empty() => random_hex(6),
            token => token,
        };
        let job_name = kube_name(&format!(
            "codex-k8s-repo-sync-{}-{run_token}",
            sanitize_name_token(repository_full_name, 20)
        ));

        let mut job_vars = vars.clone();
        job_vars.extend(
            [
                ("CODEXK8S_PLATFORM_NAMESPACE", namespace.to_string()),
                ("CODEXK8S_PRODUCTION_NAMESPACE", namespace.to_string()),
                ("CODEXK8S_REPO_SYNC_JOB_NAME", job_name.clone()),
                ("CODEXK8S_REPO_SYNC_DEST_DIR", repo_root.display().to_string()),
                ("CODEXK8S_REPO_CACHE_PVC_NAME", REPO_CACHE_PVC_NAME.to_string()),
                (
                    "CODEXK8S_REPOSITORY_ROOT",
                    self.cfg.repository_root.display().to_string(),
                ),
                ("CODEXK8S_GITHUB_REPO", repository_full_name.to_string()),
                ("CODEXK8S_BUILD_REF", build_ref.to_string()),
            ]
            .map(|(k, v)| (k.to_string(), v)),
        );
        let rendered =
            render_placeholders(REPO_SYNC_JOB_TEMPLATE, &job_vars).context("render repo sync job")?;

        self.append_task_log(
            run_id,
            "repo-sync",
            INFO,
            &format!("Repo sync started for {repository_full_name} ref {build_ref}"),
        )
        .await;
        self.kube
            .delete_job_if_exists(namespace, &job_name)
            .await
            .with_context(|| format!("delete previous repo sync job {job_name}"))?;
        self.kube
            .apply_manifest(rendered.as_bytes(), namespace, &self.cfg.field_manager)
            .await
            .with_context(|| format!("apply repo sync job {job_name}"))?;

        if let Err(e) = self
            .kube
            .wait_for_job_complete(namespace, &job_name, self.cfg.repo_sync_timeout)
            .await
        {
            let logs = self
                .kube
                .get_job_logs(namespace, &job_name, self.cfg.kaniko_job_log_tail_lines)
                .await
                .unwrap_or_default();
            if logs.trim().is_empty() {
                return Err(e).with_context(|| format!("wait repo sync job {job_name}"));
            }
            self.append_task_log(
                run_id,
                "repo-sync",
                ERROR,
                &format!("Repo sync failed logs:\n{logs}"),
            )
            .await;
            return Err(anyhow!(
                "wait repo sync job {job_name}: {e:#}; logs: {}",
                trim_log_for_error(&logs)
            ));
        }

        self.append_task_log(
            run_id,
            "repo-sync",
            INFO,
            &format!("Repo sync finished for {repository_full_name}"),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::DeployConfig,
        testing::{service, FakeKube, MemoryTasks},
    };

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    fn params(target_env: &str, build_ref: &str) -> PrepareParams {
        PrepareParams {
            run_id: "run-42".to_string(),
            namespace: "codex-k8s-prod".to_string(),
            target_env: target_env.to_string(),
            repository_full_name: "codex-k8s/codex-k8s".to_string(),
            build_ref: build_ref.to_string(),
            ..Default::default()
        }
        .normalized()
    }

    fn config(root: &Path) -> DeployConfig {
        DeployConfig {
            repository_root: root.to_path_buf(),
            github_pat: "ghp_test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn repository_root_detection() {
        let root = tempfile::tempdir().unwrap();
        assert!(!looks_like_repository_root(root.path()));
        std::fs::create_dir_all(root.path().join("deploy/base")).unwrap();
        assert!(looks_like_repository_root(root.path()));

        let other = tempfile::tempdir().unwrap();
        std::fs::write(other.path().join("services.yaml"), "").unwrap();
        assert!(looks_like_repository_root(other.path()));
        assert!(!looks_like_repository_root(Path::new("")));
    }

    #[test]
    fn snapshot_paths() {
        let root = Path::new("/repo-cache");
        assert_eq!(
            repo_snapshot_path(root, "production", "codex-k8s", "codex-k8s", "Feature/TLS"),
            PathBuf::from("/repo-cache/github/codex-k8s/codex-k8s/feature-tls")
        );
        assert_eq!(
            repo_snapshot_path(root, "production", "o", "r", ""),
            PathBuf::from("/repo-cache/github/o/r/main")
        );
        assert_eq!(repo_snapshot_path(root, "AI", "o", "r", "main"), root);
    }

    #[tokio::test]
    async fn working_trees_and_relative_roots_are_used_directly() {
        let kube = Arc::new(FakeKube::default());
        let svc = service(
            kube.clone(),
            Arc::new(MemoryTasks::default()),
            config(Path::new("relative/repo")),
        );
        let root = svc
            .resolve_run_repository_root(&params("production", "main"), &TemplateVars::new(), "run-42")
            .await
            .unwrap();
        assert_eq!(root, PathBuf::from("relative/repo"));
        assert!(kube.calls().is_empty());
    }

    #[tokio::test]
    async fn immutable_snapshot_is_reused() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = repo_snapshot_path(cache.path(), "production", "codex-k8s", "codex-k8s", COMMIT);
        std::fs::create_dir_all(snapshot.join(".git")).unwrap();

        let kube = Arc::new(FakeKube::default());
        let svc = service(kube.clone(), Arc::new(MemoryTasks::default()), config(cache.path()));
        let root = svc
            .resolve_run_repository_root(&params("production", COMMIT), &TemplateVars::new(), "run-42")
            .await
            .unwrap();
        assert_eq!(root, snapshot);
        assert!(kube.calls().is_empty());
    }

    #[tokio::test]
    async fn mutable_refs_are_synced() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = repo_snapshot_path(cache.path(), "production", "codex-k8s", "codex-k8s", "main");
        std::fs::create_dir_all(snapshot.join(".git")).unwrap();

        let kube = Arc::new(FakeKube::default());
        let tasks = Arc::new(MemoryTasks::default());
        let svc = service(kube.clone(), tasks.clone(), config(cache.path()));
        let root = svc
            .resolve_run_repository_root(&params("production", "main"), &TemplateVars::new(), "run-42")
            .await
            .unwrap();
        assert_eq!(root, snapshot);

        let job = "codex-k8s-repo-sync-codex-k8s-codex-k8s-run-42";
        assert_eq!(
            kube.calls(),
            vec![
                "apply codex-k8s-prod PersistentVolumeClaim/codex-k8s-repo-cache".to_string(),
                format!("delete job codex-k8s-prod/{job}"),
                format!("apply codex-k8s-prod Job/{job}"),
                format!("wait job codex-k8s-prod/{job}"),
            ]
        );
        assert_eq!(
            kube.secret("codex-k8s-prod", GIT_TOKEN_SECRET_NAME).unwrap()["token"],
            b"ghp_test".to_vec()
        );
        let manifest = kube.applied_manifests().pop().unwrap();
        assert!(manifest.contains(&format!("value: \"{}\"", snapshot.display())));
        assert!(manifest.contains("claimName: codex-k8s-repo-cache"));
        assert!(manifest.contains("$GIT_TOKEN@github.com/$REPO.git"));

        let messages: Vec<_> = tasks.logs("run-42").into_iter().map(|l| l.message).collect();
        assert_eq!(
            messages,
            vec![
                "Repo cache PVC ensured in namespace codex-k8s-prod",
                "Repo sync started for codex-k8s/codex-k8s ref main",
                "Repo sync finished for codex-k8s/codex-k8s",
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_must_exist_after_sync() {
        let cache = tempfile::tempdir().unwrap();
        let svc = service(
            Arc::new(FakeKube::default()),
            Arc::new(MemoryTasks::default()),
            config(cache.path()),
        );
        let err = svc
            .resolve_run_repository_root(&params("production", "main"), &TemplateVars::new(), "run-42")
            .await
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("repo snapshot is missing after repo sync: "));
    }

    #[tokio::test]
    async fn repository_name_is_validated() {
        let cache = tempfile::tempdir().unwrap();
        let svc = service(
            Arc::new(FakeKube::default()),
            Arc::new(MemoryTasks::default()),
            config(cache.path()),
        );
        let bad = PrepareParams {
            repository_full_name: "codex-k8s".to_string(),
            ..params("production", "main")
        };
        let err = svc
            .resolve_run_repository_root(&bad, &TemplateVars::new(), "run-42")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "repository_full_name must be in owner/name form, got \"codex-k8s\""
        );
    }

    #[tokio::test]
    async fn failed_sync_reports_job_logs() {
        let cache = tempfile::tempdir().unwrap();
        let kube = Arc::new(FakeKube::default());
        kube.fail_wait("codex-k8s-repo-sync-codex-k8s-codex-k8s-run-42");
        kube.set_job_logs("fatal: couldn't find remote ref");
        let svc = service(kube, Arc::new(MemoryTasks::default()), config(cache.path()));
        let err = svc
            .resolve_run_repository_root(&params("production", "main"), &TemplateVars::new(), "run-42")
            .await
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("wait repo sync job codex-k8s-repo-sync-codex-k8s-codex-k8s-run-42: "));
        assert!(err.ends_with("; logs: fatal: couldn't find remote ref"));
    }
}
