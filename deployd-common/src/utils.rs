use rand::RngCore;
use sha2::{Digest, Sha256};

fn is_image_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Lowercase DNS-label style token, at most `max` chars when `max > 0`.
pub fn sanitize_name_token(value: &str, max: usize) -> String {
    let lowered = value.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        let c = match c {
            '_' | '.' => '-',
            c if is_image_tag_char(c) => c,
            _ => '-',
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let mut out = out.trim_matches('-').to_string();
    if max > 0 && out.len() > max {
        out.truncate(max);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

pub fn sanitize_image_tag(value: &str) -> String {
    let replaced: String = value
        .trim()
        .chars()
        .map(|c| if is_image_tag_char(c) { c } else { '-' })
        .collect();
    let mut out = replaced.trim_matches(|c| c == '.' || c == '-').to_string();
    out.truncate(120);
    out
}

/// Cuts a kubernetes object name to 63 chars without a trailing dash.
pub fn kube_name(name: &str) -> String {
    let mut name = name.to_string();
    if name.len() > 63 {
        name.truncate(63);
    }
    name.trim_end_matches('-').to_string()
}

pub fn random_hex(num_bytes: usize) -> String {
    let num_bytes = if num_bytes == 0 { 16 } else { num_bytes };
    let mut raw = vec![0u8; num_bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    base16ct::lower::encode_string(&raw)
}

pub fn sha256(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    base16ct::lower::encode_string(&hash)
}

/// First `max` chars of `value`.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

pub fn trim_log_for_error(logs: &str) -> String {
    let trimmed = logs.trim();
    if trimmed.chars().count() > 500 {
        format!("{}...", truncate_chars(trimmed, 500))
    } else {
        trimmed.to_string()
    }
}
