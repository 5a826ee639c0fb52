use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use deployd_common::TemplateVars;
use regex::{Captures, Regex};

const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

static PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN));

/// Substitutes `${NAME}` placeholders, looking names up in `vars`, then in
/// the process environment. Unknown names render empty.
pub fn render_placeholders(input: &str, vars: &TemplateVars) -> Result<String> {
    let re = PLACEHOLDER
        .as_ref()
        .map_err(|e| anyhow!("invalid placeholder pattern: {e}"))?;
    let rendered = re.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => std::env::var(name).unwrap_or_default(),
        }
    });
    Ok(rendered.into_owned())
}

/// First non-blank value of `key` in `vars`, then the process environment.
pub fn value_or(vars: &TemplateVars, key: &str, fallback: &str) -> String {
    if let Some(value) = vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        return value.to_string();
    }
    if let Ok(value) = std::env::var(key) {
        let value = value.trim();
        if !value.is_empty() {
            return value.to_string();
        }
    }
    fallback.to_string()
}
