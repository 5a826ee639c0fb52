use std::path::Path;

use anyhow::{anyhow, Context, Result};
use deployd_common::{
    kube::{ConfigMapData, SecretData},
    utils::random_hex,
    TemplateVars,
};

use crate::{
    render::value_or,
    service::{DeployService, INFO},
    template_vars::is_ai_env,
};

pub const POSTGRES_SECRET_NAME: &str = "codex-k8s-postgres";
pub const RUNTIME_SECRET_NAME: &str = "codex-k8s-runtime";
pub const OAUTH2_PROXY_SECRET_NAME: &str = "codex-k8s-oauth2-proxy";
pub const LABEL_CATALOG_CONFIG_MAP: &str = "codex-k8s-label-catalog";
pub const MIGRATIONS_CONFIG_MAP: &str = "codex-k8s-migrations";
pub const MIGRATIONS_DIR: &str = "deploy/migrations";

const OAUTH2_PROXY_COOKIE_SECRET: &str = "OAUTH2_PROXY_COOKIE_SECRET";

/// Runtime settings copied from vars with a fixed fallback.
const RUNTIME_DEFAULTS: &[(&str, &str)] = &[
    ("CODEXK8S_GITHUB_PAT", ""),
    ("CODEXK8S_GITHUB_REPO", ""),
    ("CODEXK8S_FIRST_PROJECT_GITHUB_REPO", ""),
    ("CODEXK8S_OPENAI_API_KEY", ""),
    ("CODEXK8S_OPENAI_AUTH_FILE", ""),
    ("CODEXK8S_PROJECT_DB_ADMIN_HOST", "postgres"),
    ("CODEXK8S_PROJECT_DB_ADMIN_PORT", "5432"),
    ("CODEXK8S_PROJECT_DB_ADMIN_SSLMODE", "disable"),
    ("CODEXK8S_PROJECT_DB_ADMIN_DATABASE", "postgres"),
    (
        "CODEXK8S_PROJECT_DB_LIFECYCLE_ALLOWED_ENVS",
        "dev,staging,ai-staging,prod",
    ),
    ("CODEXK8S_GIT_BOT_TOKEN", ""),
    ("CODEXK8S_GIT_BOT_USERNAME", "codex-bot"),
    ("CODEXK8S_GIT_BOT_MAIL", "codex-bot@codex-k8s.local"),
    ("CODEXK8S_CONTEXT7_API_KEY", ""),
    ("CODEXK8S_MCP_TOKEN_TTL", "24h"),
    ("CODEXK8S_RUN_AGENT_LOGS_RETENTION_DAYS", "14"),
    ("CODEXK8S_LEARNING_MODE_DEFAULT", "true"),
    ("CODEXK8S_GITHUB_WEBHOOK_URL", ""),
    (
        "CODEXK8S_GITHUB_WEBHOOK_EVENTS",
        "push,pull_request,issues,issue_comment,pull_request_review,pull_request_review_comment",
    ),
    ("CODEXK8S_PUBLIC_BASE_URL", "https://example.invalid"),
    ("CODEXK8S_BOOTSTRAP_OWNER_EMAIL", "owner@example.invalid"),
    ("CODEXK8S_BOOTSTRAP_ALLOWED_EMAILS", ""),
    ("CODEXK8S_BOOTSTRAP_PLATFORM_ADMIN_EMAILS", ""),
    ("CODEXK8S_JWT_TTL", "15m"),
];

/// Runtime secrets generated once and then kept across deploys.
const GENERATED_RUNTIME_KEYS: &[&str] = &[
    "CODEXK8S_APP_SECRET_KEY",
    "CODEXK8S_TOKEN_ENCRYPTION_KEY",
    "CODEXK8S_GITHUB_WEBHOOK_SECRET",
    "CODEXK8S_JWT_SIGNING_KEY",
];

const LABEL_CATALOG_DEFAULTS: &[(&str, &str)] = &[
    ("CODEXK8S_RUN_INTAKE_LABEL", "run:intake"),
    ("CODEXK8S_RUN_INTAKE_REVISE_LABEL", "run:intake:revise"),
    ("CODEXK8S_RUN_VISION_LABEL", "run:vision"),
    ("CODEXK8S_RUN_VISION_REVISE_LABEL", "run:vision:revise"),
    ("CODEXK8S_RUN_PRD_LABEL", "run:prd"),
    ("CODEXK8S_RUN_PRD_REVISE_LABEL", "run:prd:revise"),
    ("CODEXK8S_RUN_ARCH_LABEL", "run:arch"),
    ("CODEXK8S_RUN_ARCH_REVISE_LABEL", "run:arch:revise"),
    ("CODEXK8S_RUN_DESIGN_LABEL", "run:design"),
    ("CODEXK8S_RUN_DESIGN_REVISE_LABEL", "run:design:revise"),
    ("CODEXK8S_RUN_PLAN_LABEL", "run:plan"),
    ("CODEXK8S_RUN_PLAN_REVISE_LABEL", "run:plan:revise"),
    ("CODEXK8S_RUN_DEV_LABEL", "run:dev"),
    ("CODEXK8S_RUN_DEV_REVISE_LABEL", "run:dev:revise"),
    ("CODEXK8S_RUN_DEBUG_LABEL", "run:debug"),
    ("CODEXK8S_RUN_DOC_AUDIT_LABEL", "run:doc-audit"),
    ("CODEXK8S_RUN_QA_LABEL", "run:qa"),
    ("CODEXK8S_RUN_RELEASE_LABEL", "run:release"),
    ("CODEXK8S_RUN_POSTDEPLOY_LABEL", "run:postdeploy"),
    ("CODEXK8S_RUN_OPS_LABEL", "run:ops"),
    ("CODEXK8S_RUN_SELF_IMPROVE_LABEL", "run:self-improve"),
    ("CODEXK8S_RUN_RETHINK_LABEL", "run:rethink"),
    ("CODEXK8S_MODE_DISCUSSION_LABEL", "mode:discussion"),
    ("CODEXK8S_STATE_BLOCKED_LABEL", "state:blocked"),
    ("CODEXK8S_STATE_IN_REVIEW_LABEL", "state:in-review"),
    ("CODEXK8S_STATE_APPROVED_LABEL", "state:approved"),
    ("CODEXK8S_STATE_SUPERSEDED_LABEL", "state:superseded"),
    ("CODEXK8S_STATE_ABANDONED_LABEL", "state:abandoned"),
    ("CODEXK8S_NEED_INPUT_LABEL", "need:input"),
    ("CODEXK8S_NEED_PM_LABEL", "need:pm"),
    ("CODEXK8S_NEED_SA_LABEL", "need:sa"),
    ("CODEXK8S_NEED_QA_LABEL", "need:qa"),
    ("CODEXK8S_NEED_SRE_LABEL", "need:sre"),
    ("CODEXK8S_NEED_EM_LABEL", "need:em"),
    ("CODEXK8S_NEED_KM_LABEL", "need:km"),
    ("CODEXK8S_NEED_REVIEWER_LABEL", "need:reviewer"),
    ("CODEXK8S_AI_MODEL_GPT_5_3_CODEX_LABEL", "[ai-model-gpt-5.3-codex]"),
    ("CODEXK8S_AI_MODEL_GPT_5_3_CODEX_SPARK_LABEL", "[ai-model-gpt-5.3-codex-spark]"),
    ("CODEXK8S_AI_MODEL_GPT_5_2_CODEX_LABEL", "[ai-model-gpt-5.2-codex]"),
    ("CODEXK8S_AI_MODEL_GPT_5_1_CODEX_MAX_LABEL", "[ai-model-gpt-5.1-codex-max]"),
    ("CODEXK8S_AI_MODEL_GPT_5_2_LABEL", "[ai-model-gpt-5.2]"),
    ("CODEXK8S_AI_MODEL_GPT_5_1_CODEX_MINI_LABEL", "[ai-model-gpt-5.1-codex-mini]"),
    ("CODEXK8S_AI_REASONING_LOW_LABEL", "[ai-reasoning-low]"),
    ("CODEXK8S_AI_REASONING_MEDIUM_LABEL", "[ai-reasoning-medium]"),
    ("CODEXK8S_AI_REASONING_HIGH_LABEL", "[ai-reasoning-high]"),
    ("CODEXK8S_AI_REASONING_EXTRA_HIGH_LABEL", "[ai-reasoning-extra-high]"),
];

fn existing_value(existing: Option<&SecretData>, key: &str) -> Option<String> {
    let raw = existing?.get(key)?;
    let value = String::from_utf8_lossy(raw).trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn required(vars: &TemplateVars, key: &str) -> Result<String> {
    match value_or(vars, key, "") {
        value if value.is_empty() => Err(anyhow!("{key} is required")),
        value => Ok(value),
    }
}

/// Vars first, then the value already stored in the secret, then `fallback`.
fn value_or_existing(
    vars: &TemplateVars,
    existing: Option<&SecretData>,
    key: &str,
    fallback: &str,
) -> String {
    match value_or(vars, key, "") {
        value if !value.is_empty() => value,
        _ => existing_value(existing, key).unwrap_or_else(|| fallback.to_string()),
    }
}

/// Like `value_or_existing`, but generates a value when none exists yet.
/// An explicit value that disagrees with the stored one is refused.
fn value_or_existing_or_random(
    vars: &TemplateVars,
    existing: Option<&SecretData>,
    key: &str,
    num_bytes: usize,
) -> Result<String> {
    let stored = existing_value(existing, key);
    match value_or(vars, key, "") {
        value if value.is_empty() => Ok(stored.unwrap_or_else(|| random_hex(num_bytes))),
        value => match stored {
            Some(stored) if stored != value => Err(anyhow!(
                "{key} differs from existing secret value; refusing to rotate automatically"
            )),
            _ => Ok(value),
        },
    }
}

fn is_valid_oauth_cookie_secret(value: &str) -> bool {
    matches!(value.trim().len(), 16 | 24 | 32)
}

/// Web console dev server, only wired up for `ai` slots.
fn vite_dev_upstream(vars: &TemplateVars) -> String {
    let env = match value_or(vars, "CODEXK8S_SERVICES_CONFIG_ENV", "") {
        env if env.is_empty() => value_or(vars, "CODEXK8S_ENV", ""),
        env => env,
    };
    if !is_ai_env(&env) {
        return String::new();
    }
    value_or(
        vars,
        "CODEXK8S_VITE_DEV_UPSTREAM",
        "http://codex-k8s-web-console:5173",
    )
}

fn secret(pairs: impl IntoIterator<Item = (String, String)>) -> SecretData {
    pairs
        .into_iter()
        .map(|(k, v)| (k, v.into_bytes()))
        .collect()
}

/// `*.sql` files directly under `dir`, keyed by file name.
pub fn read_migration_files(dir: &Path) -> Result<ConfigMapData> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigMapData::new()),
        Err(e) => return Err(e.into()),
    };
    let mut data = ConfigMapData::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().trim().to_string();
        if !name.to_lowercase().ends_with(".sql") {
            continue;
        }
        let content = std::fs::read_to_string(entry.path())?;
        data.insert(name, content);
    }
    Ok(data)
}

impl DeployService {
    /// Platform secrets and config maps the codex-k8s stack expects to exist
    /// before any of its manifests are applied.
    pub async fn ensure_codex_k8s_prerequisites(
        &self,
        repo_root: &Path,
        namespace: &str,
        vars: &TemplateVars,
        run_id: &str,
    ) -> Result<()> {
        let existing_postgres = self
            .kube
            .get_secret_data(namespace, POSTGRES_SECRET_NAME)
            .await
            .with_context(|| format!("load {POSTGRES_SECRET_NAME} secret"))?;
        let existing_runtime = self
            .kube
            .get_secret_data(namespace, RUNTIME_SECRET_NAME)
            .await
            .with_context(|| format!("load {RUNTIME_SECRET_NAME} secret"))?;
        let (postgres, runtime) = (existing_postgres.as_ref(), existing_runtime.as_ref());

        let oauth_client_id = required(vars, "CODEXK8S_GITHUB_OAUTH_CLIENT_ID")?;
        let oauth_client_secret = required(vars, "CODEXK8S_GITHUB_OAUTH_CLIENT_SECRET")?;

        let postgres_db = value_or_existing(vars, postgres, "CODEXK8S_POSTGRES_DB", "codex_k8s");
        let postgres_user =
            value_or_existing(vars, postgres, "CODEXK8S_POSTGRES_USER", "codex_k8s");
        let postgres_password =
            value_or_existing_or_random(vars, postgres, "CODEXK8S_POSTGRES_PASSWORD", 24)
                .context("resolve CODEXK8S_POSTGRES_PASSWORD")?;

        let registry_port =
            value_or_existing(vars, runtime, "CODEXK8S_INTERNAL_REGISTRY_PORT", "5000");
        let mut runtime_data: Vec<(String, String)> = vec![
            (
                "CODEXK8S_INTERNAL_REGISTRY_SERVICE".to_string(),
                value_or_existing(
                    vars,
                    runtime,
                    "CODEXK8S_INTERNAL_REGISTRY_SERVICE",
                    "codex-k8s-registry",
                ),
            ),
            (
                "CODEXK8S_INTERNAL_REGISTRY_HOST".to_string(),
                value_or_existing(
                    vars,
                    runtime,
                    "CODEXK8S_INTERNAL_REGISTRY_HOST",
                    &format!("127.0.0.1:{registry_port}"),
                ),
            ),
            (
                "CODEXK8S_INTERNAL_REGISTRY_STORAGE_SIZE".to_string(),
                value_or_existing(
                    vars,
                    runtime,
                    "CODEXK8S_INTERNAL_REGISTRY_STORAGE_SIZE",
                    "20Gi",
                ),
            ),
            ("CODEXK8S_INTERNAL_REGISTRY_PORT".to_string(), registry_port),
        ];
        runtime_data.extend(
            RUNTIME_DEFAULTS
                .iter()
                .map(|(key, fallback)| (key.to_string(), value_or(vars, key, fallback))),
        );
        for key in GENERATED_RUNTIME_KEYS {
            let value = value_or_existing_or_random(vars, runtime, key, 32)
                .with_context(|| format!("resolve {key}"))?;
            runtime_data.push((key.to_string(), value));
        }
        let mcp_signing_key = match value_or_existing(vars, runtime, "CODEXK8S_MCP_TOKEN_SIGNING_KEY", "") {
            key if key.is_empty() => runtime_data
                .iter()
                .find(|(k, _)| k == "CODEXK8S_TOKEN_ENCRYPTION_KEY")
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            key => key,
        };
        runtime_data.extend([
            ("CODEXK8S_MCP_TOKEN_SIGNING_KEY".to_string(), mcp_signing_key),
            (
                "CODEXK8S_PROJECT_DB_ADMIN_USER".to_string(),
                value_or(
                    vars,
                    "CODEXK8S_PROJECT_DB_ADMIN_USER",
                    &value_or(vars, "CODEXK8S_POSTGRES_USER", "codex_k8s"),
                ),
            ),
            (
                "CODEXK8S_PROJECT_DB_ADMIN_PASSWORD".to_string(),
                value_or(vars, "CODEXK8S_PROJECT_DB_ADMIN_PASSWORD", &postgres_password),
            ),
            ("CODEXK8S_GITHUB_OAUTH_CLIENT_ID".to_string(), oauth_client_id.clone()),
            (
                "CODEXK8S_GITHUB_OAUTH_CLIENT_SECRET".to_string(),
                oauth_client_secret.clone(),
            ),
            ("CODEXK8S_VITE_DEV_UPSTREAM".to_string(), vite_dev_upstream(vars)),
        ]);

        let postgres_data = secret([
            ("CODEXK8S_POSTGRES_DB".to_string(), postgres_db),
            ("CODEXK8S_POSTGRES_USER".to_string(), postgres_user),
            ("CODEXK8S_POSTGRES_PASSWORD".to_string(), postgres_password),
        ]);
        self.kube
            .upsert_secret(namespace, POSTGRES_SECRET_NAME, postgres_data)
            .await
            .with_context(|| format!("upsert {POSTGRES_SECRET_NAME} secret"))?;
        self.kube
            .upsert_secret(namespace, RUNTIME_SECRET_NAME, secret(runtime_data))
            .await
            .with_context(|| format!("upsert {RUNTIME_SECRET_NAME} secret"))?;

        let mut cookie_secret = value_or(vars, OAUTH2_PROXY_COOKIE_SECRET, "");
        if cookie_secret.is_empty() {
            let existing = self
                .kube
                .get_secret_data(namespace, OAUTH2_PROXY_SECRET_NAME)
                .await
                .context("load oauth2-proxy secret")?;
            cookie_secret = existing
                .as_ref()
                .and_then(|data| data.get(OAUTH2_PROXY_COOKIE_SECRET))
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .filter(|value| is_valid_oauth_cookie_secret(value))
                .unwrap_or_else(|| random_hex(16));
        }
        let oauth_data = secret([
            ("OAUTH2_PROXY_CLIENT_ID".to_string(), oauth_client_id),
            ("OAUTH2_PROXY_CLIENT_SECRET".to_string(), oauth_client_secret),
            (OAUTH2_PROXY_COOKIE_SECRET.to_string(), cookie_secret),
        ]);
        self.kube
            .upsert_secret(namespace, OAUTH2_PROXY_SECRET_NAME, oauth_data)
            .await
            .with_context(|| format!("upsert {OAUTH2_PROXY_SECRET_NAME} secret"))?;

        let labels: ConfigMapData = LABEL_CATALOG_DEFAULTS
            .iter()
            .map(|(key, fallback)| (key.to_string(), value_or(vars, key, fallback)))
            .collect();
        self.kube
            .upsert_config_map(namespace, LABEL_CATALOG_CONFIG_MAP, labels)
            .await
            .with_context(|| format!("upsert {LABEL_CATALOG_CONFIG_MAP} configmap"))?;

        let migrations = read_migration_files(&repo_root.join(MIGRATIONS_DIR))
            .context("read migrations")?;
        if !migrations.is_empty() {
            let count = migrations.len();
            self.kube
                .upsert_config_map(namespace, MIGRATIONS_CONFIG_MAP, migrations)
                .await
                .with_context(|| format!("upsert {MIGRATIONS_CONFIG_MAP} configmap"))?;
            self.append_task_log(
                run_id,
                "prerequisites",
                INFO,
                &format!("Migrations configmap updated with {count} files"),
            )
            .await;
        }
        Ok(())
    }
}
