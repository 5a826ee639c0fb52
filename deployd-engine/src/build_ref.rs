use deployd_common::DEFAULT_BUILD_REF;

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>'];

/// First candidate that normalizes to a usable git ref, else `main`.
pub fn resolve_runtime_build_ref<'a>(candidates: impl IntoIterator<Item = &'a str>) -> String {
    candidates
        .into_iter()
        .find_map(normalize_build_ref)
        .unwrap_or_else(|| DEFAULT_BUILD_REF.to_string())
}

/// Extracts a branch, tag or commit from user input, which may be a plain
/// ref or a pasted `git checkout` command.
pub fn normalize_build_ref(raw: &str) -> Option<String> {
    let trimmed = trim_matching_quotes(raw);
    if trimmed.is_empty() || trimmed.contains(SHELL_METACHARACTERS) {
        return None;
    }
    if !trimmed.contains(char::is_whitespace) {
        return normalize_ref_token(trimmed);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    for (idx, field) in fields.iter().enumerate() {
        if matches!(*field, "-b" | "--branch") {
            if let Some(next) = fields.get(idx + 1) {
                return normalize_ref_token(next);
            }
        }
    }
    fields
        .iter()
        .filter(|field| !matches!(**field, "git" | "checkout" | "switch" | "--detach"))
        .filter(|field| !field.starts_with('-'))
        .find_map(|field| normalize_ref_token(field))
}

fn normalize_ref_token(token: &str) -> Option<String> {
    let token = trim_matching_quotes(token);
    let token = token.strip_prefix("refs/heads/").unwrap_or(token);
    let token = token.strip_prefix("origin/").unwrap_or(token);
    if token.is_empty() || matches!(token, "." | ".." | "/") {
        return None;
    }
    if token.starts_with('/') || token.ends_with('/') || token.contains("//") {
        return None;
    }
    if token.starts_with('-') || token.contains(char::is_whitespace) {
        return None;
    }
    let allowed = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '@' | '+' | '-'));
    allowed.then(|| token.to_string())
}

fn trim_matching_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    let quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('\'') && trimmed.ends_with('\''))
            || (trimmed.starts_with('"') && trimmed.ends_with('"')));
    if quoted {
        trimmed[1..trimmed.len() - 1].trim()
    } else {
        trimmed
    }
}

/// Full-length hex commit ids never move, so their snapshots can be reused.
pub fn is_immutable_git_ref(git_ref: &str) -> bool {
    let git_ref = git_ref.trim();
    matches!(git_ref.len(), 40 | 64) && git_ref.chars().all(|c| c.is_ascii_hexdigit())
}
