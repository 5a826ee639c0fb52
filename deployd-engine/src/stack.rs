use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use deployd_common::TemplateVars;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::render::render_placeholders;

pub const DEFAULT_STACK_ENV: &str = "production";

const GO_FIELD_PATTERN: &str = r"\{\{\s*\.([A-Za-z]+)\s*\}\}";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: StackSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
    #[serde(default)]
    pub images: BTreeMap<String, Image>,
    #[serde(default)]
    pub infrastructure: Vec<InfrastructureItem>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub orchestration: Orchestration,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub namespace_template: String,
    #[serde(default)]
    pub domain_template: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tag_template: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub dockerfile: String,
    #[serde(default)]
    pub local: String,
}

impl Image {
    pub fn is_build(&self) -> bool {
        self.kind.trim().eq_ignore_ascii_case("build")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestRef {
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureItem {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub manifests: Vec<ManifestRef>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum ServiceScope {
    #[default]
    Environment,
    InfrastructureSingleton,
}

impl TryFrom<String> for ServiceScope {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "environment" => Ok(ServiceScope::Environment),
            "infrastructure-singleton" => Ok(ServiceScope::InfrastructureSingleton),
            other => Err(anyhow!(
                "unsupported service scope {other:?}, expected environment or infrastructure-singleton"
            )),
        }
    }
}

impl From<ServiceScope> for String {
    fn from(scope: ServiceScope) -> Self {
        match scope {
            ServiceScope::Environment => "environment".to_string(),
            ServiceScope::InfrastructureSingleton => "infrastructure-singleton".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub deploy_group: String,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub scope: ServiceScope,
    #[serde(default)]
    pub manifests: Vec<ManifestRef>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Orchestration {
    #[serde(default)]
    pub deploy_order: Vec<String>,
}

impl Stack {
    /// Effective project name: `spec.project`, else `metadata.name`.
    pub fn project(&self) -> &str {
        match self.spec.project.trim() {
            "" => self.metadata.name.trim(),
            project => project,
        }
    }

    /// Environment settings with `from` inheritance applied.
    pub fn resolve_environment(&self, name: &str) -> Result<Environment> {
        resolve_environment(&self.spec.environments, name)
    }
}

fn resolve_environment(
    environments: &BTreeMap<String, Environment>,
    name: &str,
) -> Result<Environment> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("environment is required"));
    }
    if environments.is_empty() {
        return Err(anyhow!("environments section is empty"));
    }

    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = name.to_string();
    loop {
        if !visited.insert(current.clone()) {
            return Err(anyhow!(
                "environment inheritance cycle detected at {current:?}"
            ));
        }
        let env = environments
            .get(&current)
            .ok_or_else(|| anyhow!("environment {current:?} not defined"))?;
        chain.push(env);
        match env.from.trim() {
            "" => break,
            parent => current = parent.to_string(),
        }
    }

    let mut merged = Environment::default();
    for env in chain.iter().rev() {
        if !env.namespace_template.trim().is_empty() {
            merged.namespace_template = env.namespace_template.clone();
        }
        if !env.domain_template.trim().is_empty() {
            merged.domain_template = env.domain_template.clone();
        }
        merged.from = env.from.clone();
    }
    Ok(merged)
}

/// Values resolved while loading a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackContext {
    pub env: String,
    pub namespace: String,
    pub project: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedStack {
    pub stack: Stack,
    pub context: StackContext,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions<'a> {
    pub env: &'a str,
    pub namespace: &'a str,
    pub slot: i32,
    pub vars: &'a TemplateVars,
}

/// Parses the stack descriptor of a run.
pub trait StackLoader: Send + Sync {
    fn load(&self, path: &Path, opts: LoadOptions<'_>) -> Result<LoadedStack>;
}

/// Loads `services.yaml` style descriptors from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlStackLoader;

impl StackLoader for YamlStackLoader {
    fn load(&self, path: &Path, opts: LoadOptions<'_>) -> Result<LoadedStack> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read services file {}", path.display()))?;
        parse_stack(&raw, opts)
    }
}

/// Renders, parses and validates one descriptor.
pub fn parse_stack(raw: &str, opts: LoadOptions<'_>) -> Result<LoadedStack> {
    let rendered = render_placeholders(raw, opts.vars)?;
    let mut stack: Stack =
        serde_yaml::from_str(&rendered).context("parse rendered services.yaml")?;

    let project = stack.project().to_string();
    if project.is_empty() {
        return Err(anyhow!(
            "project is required (spec.project or metadata.name)"
        ));
    }
    if stack.spec.project.trim().is_empty() {
        stack.spec.project = project.clone();
    }
    if stack.metadata.name.trim().is_empty() {
        stack.metadata.name = project.clone();
    }

    let env = match opts.env.trim() {
        "" => DEFAULT_STACK_ENV.to_string(),
        env => env.to_string(),
    };
    validate(&stack)?;

    let mut context = StackContext {
        env,
        namespace: opts.namespace.trim().to_string(),
        project,
    };
    let env_cfg = stack.resolve_environment(&context.env)?;
    if context.namespace.is_empty() {
        let from_template =
            render_context_template(&env_cfg.namespace_template, &context, opts.slot)
                .context("render namespace template")?;
        context.namespace = match from_template.trim() {
            "" => default_namespace(&context.project, &context.env, opts.slot),
            ns => ns.to_string(),
        };
    }

    for environment in stack.spec.environments.values_mut() {
        environment.namespace_template =
            render_context_template(&environment.namespace_template, &context, opts.slot)
                .context("render namespace template")?;
        environment.domain_template =
            render_context_template(&environment.domain_template, &context, opts.slot)
                .context("render domain template")?;
    }

    Ok(LoadedStack { stack, context })
}

fn validate(stack: &Stack) -> Result<()> {
    let mut seen = HashSet::new();
    for (idx, service) in stack.spec.services.iter().enumerate() {
        let name = service.name.trim();
        if name.is_empty() {
            return Err(anyhow!("service[{idx}].name is required"));
        }
        if !seen.insert(name) {
            return Err(anyhow!("duplicate service name {name:?}"));
        }
    }
    let mut seen = HashSet::new();
    for (idx, item) in stack.spec.infrastructure.iter().enumerate() {
        let name = item.name.trim();
        if name.is_empty() {
            return Err(anyhow!("infrastructure[{idx}].name is required"));
        }
        if !seen.insert(name) {
            return Err(anyhow!("duplicate infrastructure item {name:?}"));
        }
    }
    Ok(())
}

fn default_namespace(project: &str, env: &str, slot: i32) -> String {
    match env {
        "ai" if slot > 0 => format!("{project}-dev-{slot}"),
        "ai" => String::new(),
        "ai-repair" => format!("{project}-production"),
        _ => format!("{project}-{env}"),
    }
}

/// Renders `{{ .Project }}`, `{{ .Env }}`, `{{ .Namespace }}` and `{{ .Slot }}`.
fn render_context_template(template: &str, context: &StackContext, slot: i32) -> Result<String> {
    let re = Regex::new(GO_FIELD_PATTERN)?;
    let mut unknown = None;
    let rendered = re.replace_all(template, |caps: &Captures| match &caps[1] {
        "Project" => context.project.clone(),
        "Env" => context.env.clone(),
        "Namespace" => context.namespace.clone(),
        "Slot" => slot.to_string(),
        other => {
            unknown.get_or_insert_with(|| other.to_string());
            String::new()
        }
    });
    if let Some(field) = unknown {
        return Err(anyhow!("unknown template field .{field}"));
    }
    Ok(rendered.trim().to_string())
}
