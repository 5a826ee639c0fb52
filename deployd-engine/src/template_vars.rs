use deployd_common::{
    utils::{sanitize_image_tag, sanitize_name_token},
    PrepareParams, TemplateVars,
};

use crate::{build_ref::resolve_runtime_build_ref, render::value_or};

pub const AI_ENV: &str = "ai";
pub const AI_STAGING_ENV: &str = "ai-staging";

const DEFAULT_TEMPLATE_VARS: &[(&str, &str)] = &[
    ("CODEXK8S_STAGING_NAMESPACE", "codex-k8s-ai-staging"),
    ("CODEXK8S_INTERNAL_REGISTRY_HOST", "127.0.0.1:5000"),
    ("CODEXK8S_KANIKO_CACHE_ENABLED", "true"),
    ("CODEXK8S_KANIKO_CACHE_TTL", "168h"),
    ("CODEXK8S_KANIKO_CACHE_COMPRESSED", "false"),
    ("CODEXK8S_KANIKO_RESOURCES_REQUEST_CPU", "8"),
    ("CODEXK8S_KANIKO_RESOURCES_REQUEST_MEMORY", "16Gi"),
    ("CODEXK8S_KANIKO_RESOURCES_LIMIT_CPU", "16"),
    ("CODEXK8S_KANIKO_RESOURCES_LIMIT_MEMORY", "32Gi"),
    ("CODEXK8S_API_GATEWAY_IMAGE", "127.0.0.1:5000/codex-k8s/api-gateway:latest"),
    ("CODEXK8S_CONTROL_PLANE_IMAGE", "127.0.0.1:5000/codex-k8s/control-plane:latest"),
    ("CODEXK8S_WORKER_IMAGE", "127.0.0.1:5000/codex-k8s/worker:latest"),
    ("CODEXK8S_AGENT_RUNNER_IMAGE", "127.0.0.1:5000/codex-k8s/agent-runner:latest"),
    ("CODEXK8S_WEB_CONSOLE_IMAGE", "127.0.0.1:5000/codex-k8s/web-console:latest"),
    ("CODEXK8S_WORKER_JOB_IMAGE", "127.0.0.1:5000/codex-k8s/agent-runner:latest"),
    ("CODEXK8S_WORKER_REPLICAS", "1"),
    ("CODEXK8S_WORKER_POLL_INTERVAL", "5s"),
    ("CODEXK8S_WORKER_CLAIM_LIMIT", "2"),
    ("CODEXK8S_WORKER_RUNNING_CHECK_LIMIT", "200"),
    ("CODEXK8S_WORKER_SLOTS_PER_PROJECT", "2"),
    ("CODEXK8S_WORKER_SLOT_LEASE_TTL", "10m"),
    ("CODEXK8S_WORKER_K8S_NAMESPACE", "codex-k8s-ai-staging"),
    ("CODEXK8S_WORKER_JOB_COMMAND", "/usr/local/bin/codex-k8s-agent-runner"),
    ("CODEXK8S_WORKER_JOB_TTL_SECONDS", "600"),
    ("CODEXK8S_WORKER_JOB_BACKOFF_LIMIT", "0"),
    ("CODEXK8S_WORKER_JOB_ACTIVE_DEADLINE_SECONDS", "900"),
    ("CODEXK8S_WORKER_RUN_NAMESPACE_PREFIX", "codex-issue"),
    ("CODEXK8S_WORKER_RUN_NAMESPACE_CLEANUP", "true"),
    ("CODEXK8S_WORKER_RUN_SERVICE_ACCOUNT", "codex-runner"),
    ("CODEXK8S_WORKER_RUN_ROLE_NAME", "codex-runner"),
    ("CODEXK8S_WORKER_RUN_ROLE_BINDING_NAME", "codex-runner"),
    ("CODEXK8S_WORKER_RUN_RESOURCE_QUOTA_NAME", "codex-run-quota"),
    ("CODEXK8S_WORKER_RUN_LIMIT_RANGE_NAME", "codex-run-limits"),
    ("CODEXK8S_WORKER_RUN_CREDENTIALS_SECRET_NAME", "codex-run-credentials"),
    ("CODEXK8S_WORKER_RUN_QUOTA_PODS", "20"),
    ("CODEXK8S_WORKER_RUN_QUOTA_REQUESTS_CPU", "6"),
    ("CODEXK8S_WORKER_RUN_QUOTA_REQUESTS_MEMORY", "24Gi"),
    ("CODEXK8S_WORKER_RUN_QUOTA_LIMITS_CPU", "8"),
    ("CODEXK8S_WORKER_RUN_QUOTA_LIMITS_MEMORY", "32Gi"),
    ("CODEXK8S_WORKER_RUN_LIMIT_DEFAULT_REQUEST_CPU", "4"),
    ("CODEXK8S_WORKER_RUN_LIMIT_DEFAULT_REQUEST_MEMORY", "16Gi"),
    ("CODEXK8S_WORKER_RUN_LIMIT_DEFAULT_CPU", "6"),
    ("CODEXK8S_WORKER_RUN_LIMIT_DEFAULT_MEMORY", "24Gi"),
    ("CODEXK8S_AGENT_DEFAULT_MODEL", "gpt-5.3-codex"),
    ("CODEXK8S_AGENT_DEFAULT_REASONING_EFFORT", "high"),
    ("CODEXK8S_AGENT_DEFAULT_LOCALE", "ru"),
    ("CODEXK8S_AGENT_BASE_BRANCH", "main"),
    ("CODEXK8S_STAGING_DOMAIN", "staging.example.com"),
    ("CODEXK8S_API_GATEWAY_RESOURCES_REQUEST_CPU", "100m"),
    ("CODEXK8S_API_GATEWAY_RESOURCES_REQUEST_MEMORY", "256Mi"),
    ("CODEXK8S_API_GATEWAY_RESOURCES_LIMIT_CPU", "1000m"),
    ("CODEXK8S_API_GATEWAY_RESOURCES_LIMIT_MEMORY", "1Gi"),
    ("CODEXK8S_CONTROL_PLANE_RESOURCES_REQUEST_CPU", "100m"),
    ("CODEXK8S_CONTROL_PLANE_RESOURCES_REQUEST_MEMORY", "256Mi"),
    ("CODEXK8S_CONTROL_PLANE_RESOURCES_LIMIT_CPU", "1000m"),
    ("CODEXK8S_CONTROL_PLANE_RESOURCES_LIMIT_MEMORY", "1Gi"),
    ("CODEXK8S_WORKER_RESOURCES_REQUEST_CPU", "100m"),
    ("CODEXK8S_WORKER_RESOURCES_REQUEST_MEMORY", "256Mi"),
    ("CODEXK8S_WORKER_RESOURCES_LIMIT_CPU", "1000m"),
    ("CODEXK8S_WORKER_RESOURCES_LIMIT_MEMORY", "1Gi"),
    ("CODEXK8S_WEB_CONSOLE_RESOURCES_REQUEST_CPU", "100m"),
    ("CODEXK8S_WEB_CONSOLE_RESOURCES_REQUEST_MEMORY", "128Mi"),
    ("CODEXK8S_WEB_CONSOLE_RESOURCES_LIMIT_CPU", "500m"),
    ("CODEXK8S_WEB_CONSOLE_RESOURCES_LIMIT_MEMORY", "512Mi"),
];

pub fn default_template_vars() -> TemplateVars {
    DEFAULT_TEMPLATE_VARS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn is_ai_env(env: &str) -> bool {
    env.trim().eq_ignore_ascii_case(AI_ENV)
}

fn is_production_env(env: &str) -> bool {
    matches!(env.trim().to_lowercase().as_str(), "production" | "prod")
}

fn blank(vars: &TemplateVars, key: &str) -> bool {
    vars.get(key).map_or(true, |v| v.trim().is_empty())
}

/// Namespace to deploy into before the stack descriptor has been consulted.
pub fn initial_target_namespace(params: &PrepareParams) -> String {
    let namespace = params.namespace.trim();
    if namespace.is_empty() && params.target_env.trim().eq_ignore_ascii_case(AI_STAGING_ENV) {
        return ai_staging_namespace(&params.repository_full_name);
    }
    namespace.to_string()
}

fn ai_staging_namespace(repository_full_name: &str) -> String {
    let full_name = repository_full_name.trim();
    let name = match full_name.split_once('/') {
        Some((_, repo)) => repo,
        None => full_name,
    };
    match sanitize_name_token(name, 40) {
        name if name.is_empty() => name,
        name => format!("{name}-ai-staging"),
    }
}

pub fn default_tls_secret_name(target_env: &str) -> &'static str {
    if is_ai_env(target_env) {
        "codex-k8s-ai-tls"
    } else {
        "codex-k8s-production-tls"
    }
}

fn public_domain(target_env: &str, namespace: &str, vars: &TemplateVars) -> String {
    if is_ai_env(target_env) {
        let base = value_or(vars, "CODEXK8S_AI_DOMAIN", "");
        if !base.is_empty() && !namespace.is_empty() {
            return format!("{namespace}.{base}");
        }
    }
    value_or(vars, "CODEXK8S_PRODUCTION_DOMAIN", "")
}

fn default_platform_replicas(target_env: &str) -> &'static str {
    if is_production_env(target_env) {
        "2"
    } else {
        "1"
    }
}

fn default_worker_replicas(target_env: &str, platform_replicas: &str) -> String {
    let platform_replicas = platform_replicas.trim();
    if is_production_env(target_env) {
        return match platform_replicas.parse::<u32>() {
            Ok(replicas) if replicas >= 3 => replicas.to_string(),
            _ => "3".to_string(),
        };
    }
    match platform_replicas {
        "" => "1".to_string(),
        replicas => replicas.to_string(),
    }
}

/// Variables available to every manifest of a run: built-in defaults,
/// overlaid by the process environment, then run-specific values.
pub fn build_template_vars(params: &PrepareParams, namespace: &str) -> TemplateVars {
    let mut vars = default_template_vars();
    vars.extend(std::env::vars_os().filter_map(|(k, v)| {
        let key = k.into_string().ok().filter(|k| !k.is_empty())?;
        Some((key, v.into_string().ok()?))
    }));

    if blank(&vars, "CODEXK8S_PLATFORM_NAMESPACE") {
        let production = vars
            .get("CODEXK8S_PRODUCTION_NAMESPACE")
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        vars.insert("CODEXK8S_PLATFORM_NAMESPACE".to_string(), production);
    }

    let target_env = match params.target_env.trim() {
        "" => AI_ENV,
        env => env,
    };
    vars.insert("CODEXK8S_ENV".to_string(), target_env.to_string());
    vars.insert(
        "CODEXK8S_SERVICES_CONFIG_ENV".to_string(),
        target_env.to_string(),
    );
    let hot_reload = if is_ai_env(target_env) {
        "true".to_string()
    } else {
        match vars.get("CODEXK8S_HOT_RELOAD").map(|v| v.trim()) {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => "false".to_string(),
        }
    };
    vars.insert("CODEXK8S_HOT_RELOAD".to_string(), hot_reload);
    if is_ai_env(target_env) {
        vars.insert("CODEXK8S_KANIKO_CLEANUP".to_string(), "false".to_string());
    }

    let namespace = namespace.trim();
    if !namespace.is_empty() {
        vars.insert(
            "CODEXK8S_STAGING_NAMESPACE".to_string(),
            namespace.to_string(),
        );
        vars.insert(
            "CODEXK8S_WORKER_K8S_NAMESPACE".to_string(),
            namespace.to_string(),
        );
        if blank(&vars, "CODEXK8S_CONTROL_PLANE_GRPC_TARGET") {
            vars.insert(
                "CODEXK8S_CONTROL_PLANE_GRPC_TARGET".to_string(),
                format!("codex-k8s-control-plane.{namespace}.svc.cluster.local:9090"),
            );
        }
        if blank(&vars, "CODEXK8S_CONTROL_PLANE_MCP_BASE_URL") {
            vars.insert(
                "CODEXK8S_CONTROL_PLANE_MCP_BASE_URL".to_string(),
                format!("http://codex-k8s-control-plane.{namespace}.svc.cluster.local:8081/mcp"),
            );
        }
    }

    let domain = public_domain(target_env, namespace, &vars);
    if !domain.is_empty() {
        if is_ai_env(target_env) || blank(&vars, "CODEXK8S_PUBLIC_BASE_URL") {
            vars.insert(
                "CODEXK8S_PUBLIC_BASE_URL".to_string(),
                format!("https://{domain}"),
            );
        }
        vars.insert("CODEXK8S_PUBLIC_DOMAIN".to_string(), domain);
    }

    let production_domain = value_or(&vars, "CODEXK8S_PRODUCTION_DOMAIN", "");
    if !production_domain.is_empty() {
        let oauth_defaults = [
            (
                "CODEXK8S_SHARED_OAUTH2_PROXY_AUTH_URL",
                format!("https://{production_domain}/oauth2/auth"),
            ),
            (
                "CODEXK8S_SHARED_OAUTH2_PROXY_SIGNIN_URL",
                format!(
                    "https://{production_domain}/oauth2/start?rd=$scheme://$host$request_uri"
                ),
            ),
            (
                "CODEXK8S_OAUTH2_PROXY_COOKIE_DOMAIN",
                format!(".{}", production_domain.trim_start_matches('.')),
            ),
        ];
        for (key, value) in oauth_defaults {
            if blank(&vars, key) {
                vars.insert(key.to_string(), value);
            }
        }
    }
    if blank(&vars, "CODEXK8S_TLS_SECRET_NAME") {
        vars.insert(
            "CODEXK8S_TLS_SECRET_NAME".to_string(),
            default_tls_secret_name(target_env).to_string(),
        );
    }

    let build_ref = resolve_runtime_build_ref([
        params.build_ref.as_str(),
        vars.get("CODEXK8S_BUILD_REF").map_or("", String::as_str),
        vars.get("CODEXK8S_AGENT_BASE_BRANCH").map_or("", String::as_str),
    ]);
    vars.insert("CODEXK8S_BUILD_TAG".to_string(), sanitize_image_tag(&build_ref));
    vars.insert("CODEXK8S_BUILD_REF".to_string(), build_ref);

    let repository = params.repository_full_name.trim();
    if !repository.is_empty() {
        vars.insert("CODEXK8S_GITHUB_REPO".to_string(), repository.to_string());
    }

    if blank(&vars, "CODEXK8S_PLATFORM_DEPLOYMENT_REPLICAS") {
        vars.insert(
            "CODEXK8S_PLATFORM_DEPLOYMENT_REPLICAS".to_string(),
            default_platform_replicas(&params.target_env).to_string(),
        );
    }
    if blank(&vars, "CODEXK8S_WORKER_REPLICAS") {
        let platform = vars
            .get("CODEXK8S_PLATFORM_DEPLOYMENT_REPLICAS")
            .cloned()
            .unwrap_or_default();
        vars.insert(
            "CODEXK8S_WORKER_REPLICAS".to_string(),
            default_worker_replicas(&params.target_env, &platform),
        );
    }

    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target_env: &str) -> PrepareParams {
        PrepareParams {
            run_id: "run-1".to_string(),
            target_env: target_env.to_string(),
            repository_full_name: "codex-k8s/codex-k8s".to_string(),
            build_ref: "git checkout -b feature/tls".to_string(),
            ..Default::default()
        }
        .normalized()
    }

    #[test]
    fn ai_runs_get_slot_specific_values() {
        let vars = build_template_vars(&params("ai"), "codex-k8s-dev-2");
        assert_eq!(vars["CODEXK8S_ENV"], "ai");
        assert_eq!(vars["CODEXK8S_SERVICES_CONFIG_ENV"], "ai");
        assert_eq!(vars["CODEXK8S_HOT_RELOAD"], "true");
        assert_eq!(vars["CODEXK8S_KANIKO_CLEANUP"], "false");
        assert_eq!(vars["CODEXK8S_STAGING_NAMESPACE"], "codex-k8s-dev-2");
        assert_eq!(vars["CODEXK8S_WORKER_K8S_NAMESPACE"], "codex-k8s-dev-2");
        assert_eq!(
            vars["CODEXK8S_CONTROL_PLANE_GRPC_TARGET"],
            "codex-k8s-control-plane.codex-k8s-dev-2.svc.cluster.local:9090"
        );
        assert_eq!(vars["CODEXK8S_TLS_SECRET_NAME"], "codex-k8s-ai-tls");
        assert_eq!(vars["CODEXK8S_BUILD_REF"], "feature/tls");
        assert_eq!(vars["CODEXK8S_BUILD_TAG"], "feature-tls");
        assert_eq!(vars["CODEXK8S_GITHUB_REPO"], "codex-k8s/codex-k8s");
        assert_eq!(vars["CODEXK8S_PLATFORM_DEPLOYMENT_REPLICAS"], "1");
        assert_eq!(vars["CODEXK8S_WORKER_REPLICAS"], "1");
    }

    #[test]
    fn defaults_survive_without_namespace() {
        let vars = build_template_vars(&params("staging"), "");
        assert_eq!(vars["CODEXK8S_STAGING_NAMESPACE"], "codex-k8s-ai-staging");
        assert_eq!(vars["CODEXK8S_AGENT_BASE_BRANCH"], "main");
        assert_eq!(vars["CODEXK8S_TLS_SECRET_NAME"], "codex-k8s-production-tls");
    }

    #[test]
    fn worker_replicas_have_a_production_floor() {
        assert_eq!(default_worker_replicas("production", "2"), "3");
        assert_eq!(default_worker_replicas("prod", "5"), "5");
        assert_eq!(default_worker_replicas("ai", "2"), "2");
        assert_eq!(default_worker_replicas("ai", ""), "1");
        assert_eq!(default_platform_replicas("Production"), "2");
        assert_eq!(default_platform_replicas("ai-staging"), "1");
    }

    #[test]
    fn ai_staging_namespace_comes_from_repository() {
        let params = params("ai-staging");
        assert_eq!(initial_target_namespace(&params), "codex-k8s-ai-staging");
        assert_eq!(ai_staging_namespace("Owner/My_Repo"), "my-repo-ai-staging");
        assert_eq!(ai_staging_namespace(""), "");

        let explicit = PrepareParams {
            namespace: "given".to_string(),
            ..params
        };
        assert_eq!(initial_target_namespace(&explicit), "given");
    }

    #[test]
    fn public_domain_for_ai_slots() {
        let mut vars = TemplateVars::new();
        vars.insert("CODEXK8S_AI_DOMAIN".to_string(), "ai.example.com".to_string());
        vars.insert(
            "CODEXK8S_PRODUCTION_DOMAIN".to_string(),
            "platform.example.com".to_string(),
        );
        assert_eq!(
            public_domain("ai", "codex-k8s-dev-1", &vars),
            "codex-k8s-dev-1.ai.example.com"
        );
        assert_eq!(public_domain("ai", "", &vars), "platform.example.com");
        assert_eq!(
            public_domain("production", "codex-k8s-prod", &vars),
            "platform.example.com"
        );
    }
}
