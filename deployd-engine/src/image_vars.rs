use deployd_common::TemplateVars;

use crate::stack::{Image, Stack};

pub const WORKER_JOB_IMAGE_VAR: &str = "CODEXK8S_WORKER_JOB_IMAGE";
pub const AGENT_RUNNER_IMAGE_VAR: &str = "CODEXK8S_AGENT_RUNNER_IMAGE";

/// `CODEXK8S_<NAME>_IMAGE` for an image name, or `None` when nothing is left
/// after normalization.
pub fn image_env_var(name: &str) -> Option<String> {
    let normalized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    let normalized = normalized.trim_matches('_');
    if normalized.is_empty() {
        return None;
    }
    Some(format!("CODEXK8S_{normalized}_IMAGE"))
}

/// `local` when set, else `repository:tag` with a `latest` default tag.
pub fn stack_image_ref(image: &Image) -> Option<String> {
    let local = image.local.trim();
    if !local.is_empty() {
        return Some(local.to_string());
    }
    let repository = image.repository.trim();
    if repository.is_empty() {
        return None;
    }
    let tag = match image.tag_template.trim() {
        "" => "latest",
        tag => tag,
    };
    Some(format!("{repository}:{tag}"))
}

/// Exports one image variable per stack image.
pub fn apply_stack_image_vars(vars: &mut TemplateVars, stack: &Stack) {
    for (name, image) in &stack.spec.images {
        if let (Some(key), Some(image_ref)) = (image_env_var(name), stack_image_ref(image)) {
            vars.insert(key, image_ref);
        }
    }
}

/// Publishes the reference of a freshly built image.
pub fn apply_built_image_result(vars: &mut TemplateVars, image_name: &str, image_ref: &str) {
    let Some(key) = image_env_var(image_name) else {
        return;
    };
    if key == AGENT_RUNNER_IMAGE_VAR
        && vars
            .get(WORKER_JOB_IMAGE_VAR)
            .map_or(true, |v| v.trim().is_empty())
    {
        vars.insert(WORKER_JOB_IMAGE_VAR.to_string(), image_ref.to_string());
    }
    vars.insert(key, image_ref.to_string());
}

/// Falls back to the agent runner image for worker jobs.
pub fn ensure_worker_job_image(vars: &mut TemplateVars) {
    if vars
        .get(WORKER_JOB_IMAGE_VAR)
        .is_some_and(|v| !v.trim().is_empty())
    {
        return;
    }
    if let Some(runner) = vars
        .get(AGENT_RUNNER_IMAGE_VAR)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        vars.insert(WORKER_JOB_IMAGE_VAR.to_string(), runner);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::stack::StackSpec;

    #[test]
    fn env_var_names() {
        assert_eq!(
            image_env_var("api-gateway").as_deref(),
            Some("CODEXK8S_API_GATEWAY_IMAGE")
        );
        assert_eq!(
            image_env_var(" _web.console2_ ").as_deref(),
            Some("CODEXK8S_WEB_CONSOLE2_IMAGE")
        );
        assert_eq!(image_env_var("--"), None);
    }

    #[test]
    fn stack_images_are_exported() {
        let images: BTreeMap<String, Image> = [
            (
                "api-gateway".to_string(),
                Image {
                    repository: "registry/api".to_string(),
                    tag_template: "v2".to_string(),
                    ..Default::default()
                },
            ),
            (
                "busybox".to_string(),
                Image {
                    local: "busybox:1.36".to_string(),
                    repository: "ignored".to_string(),
                    ..Default::default()
                },
            ),
            (
                "web".to_string(),
                Image {
                    repository: "registry/web".to_string(),
                    ..Default::default()
                },
            ),
            ("empty".to_string(), Image::default()),
        ]
        .into_iter()
        .collect();
        let stack = Stack {
            spec: StackSpec {
                images,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut vars = TemplateVars::new();
        apply_stack_image_vars(&mut vars, &stack);
        assert_eq!(vars["CODEXK8S_API_GATEWAY_IMAGE"], "registry/api:v2");
        assert_eq!(vars["CODEXK8S_BUSYBOX_IMAGE"], "busybox:1.36");
        assert_eq!(vars["CODEXK8S_WEB_IMAGE"], "registry/web:latest");
        assert!(!vars.contains_key("CODEXK8S_EMPTY_IMAGE"));
    }

    #[test]
    fn built_agent_runner_seeds_worker_job_image() {
        let mut vars = TemplateVars::new();
        apply_built_image_result(&mut vars, "agent-runner", "registry/runner:abc");
        assert_eq!(vars[AGENT_RUNNER_IMAGE_VAR], "registry/runner:abc");
        assert_eq!(vars[WORKER_JOB_IMAGE_VAR], "registry/runner:abc");

        apply_built_image_result(&mut vars, "agent-runner", "registry/runner:def");
        assert_eq!(vars[WORKER_JOB_IMAGE_VAR], "registry/runner:abc");

        apply_built_image_result(&mut vars, "control-plane", "registry/cp:def");
        assert_eq!(vars["CODEXK8S_CONTROL_PLANE_IMAGE"], "registry/cp:def");
    }

    #[test]
    fn worker_job_image_fallback() {
        let mut vars = TemplateVars::new();
        vars.insert(WORKER_JOB_IMAGE_VAR.to_string(), " ".to_string());
        vars.insert(AGENT_RUNNER_IMAGE_VAR.to_string(), "runner:1".to_string());
        ensure_worker_job_image(&mut vars);
        assert_eq!(vars[WORKER_JOB_IMAGE_VAR], "runner:1");
    }
}
