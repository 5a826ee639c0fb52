use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::ACCEPT, StatusCode};
use serde::Deserialize;

const MANIFEST_ACCEPT: &str =
    "application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.manifest.v1+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub tag: String,
    pub digest: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// The internal image registry, as far as builds need it.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Tags of `repository`, newest first. An unknown repository has none.
    async fn list_tags(&self, repository: &str) -> Result<Vec<TagInfo>>;

    /// Deletes the manifest behind `tag`. Returns false when it was already gone.
    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<bool>;
}

/// Docker Registry HTTP API v2 client.
pub struct HttpRegistry {
    base: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    config: ManifestConfig,
}

#[derive(Deserialize, Default)]
struct ManifestConfig {
    #[serde(default)]
    digest: String,
}

#[derive(Deserialize)]
struct ImageConfig {
    #[serde(default)]
    created: String,
}

impl HttpRegistry {
    pub fn new(base_url: &str, http: reqwest::Client) -> Result<Self> {
        let base = base_url.trim();
        if base.is_empty() {
            return Err(anyhow!("registry base url is required"));
        }
        let base = if base.contains("://") {
            base.to_string()
        } else {
            format!("http://{base}")
        };
        let url = reqwest::Url::parse(&base)
            .with_context(|| format!("parse registry base url {base}"))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(anyhow!("registry host is required"));
        }
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, repo_path: &str, rest: &str) -> String {
        format!("{}/v2/{repo_path}/{rest}", self.base)
    }

    async fn tag_digest(&self, repo_path: &str, tag: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .head(self.url(repo_path, &format!("manifests/{}", escape_segment(tag))))
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .context("request digest")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if resp.status() != StatusCode::OK {
            return Err(anyhow!(
                "digest request failed: status={}",
                resp.status().as_u16()
            ));
        }
        match resp
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
        {
            Some(digest) if !digest.is_empty() => Ok(Some(digest.to_string())),
            _ => Err(anyhow!("registry response does not include {DIGEST_HEADER}")),
        }
    }

    /// Image creation time from the config blob. Missing or unreadable
    /// metadata yields `None`.
    async fn created_at(&self, repo_path: &str, digest: &str) -> Result<Option<DateTime<Utc>>> {
        let resp = self
            .http
            .get(self.url(repo_path, &format!("manifests/{}", escape_segment(digest))))
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .context("request manifest")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        let body = resp.text().await.context("read manifest response")?;
        if status != StatusCode::OK {
            return Err(anyhow!(
                "manifest request failed: status={} body={}",
                status.as_u16(),
                body.trim()
            ));
        }
        let manifest: Manifest =
            serde_json::from_str(&body).context("decode manifest response")?;
        let config_digest = manifest.config.digest.trim();
        if config_digest.is_empty() {
            return Ok(None);
        }

        let resp = self
            .http
            .get(self.url(repo_path, &format!("blobs/{}", escape_segment(config_digest))))
            .send()
            .await
            .context("request blob")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        let body = resp.text().await.context("read blob response")?;
        if status != StatusCode::OK {
            return Err(anyhow!(
                "blob request failed: status={} body={}",
                status.as_u16(),
                body.trim()
            ));
        }
        Ok(serde_json::from_str::<ImageConfig>(&body)
            .ok()
            .and_then(|config| DateTime::parse_from_rfc3339(config.created.trim()).ok())
            .map(|created| created.with_timezone(&Utc)))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    async fn list_tags(&self, repository: &str) -> Result<Vec<TagInfo>> {
        let repo_path = encode_repository(repository)?;
        let resp = self
            .http
            .get(self.url(&repo_path, "tags/list"))
            .send()
            .await
            .context("request tags list")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(vec![]);
        }
        let status = resp.status();
        let body = resp.text().await.context("read tags response")?;
        if status != StatusCode::OK {
            return Err(anyhow!(
                "tags request failed: status={} body={}",
                status.as_u16(),
                body.trim()
            ));
        }
        let list: TagList = serde_json::from_str(&body).context("decode tags response")?;

        let mut items = vec![];
        for tag in list.tags.unwrap_or_default() {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            let Some(digest) = self
                .tag_digest(&repo_path, tag)
                .await
                .with_context(|| format!("resolve digest for {repository}:{tag}"))?
            else {
                continue;
            };
            let created_at = self
                .created_at(&repo_path, &digest)
                .await
                .with_context(|| format!("load metadata for {repository}@{digest}"))?;
            items.push(TagInfo {
                tag: tag.to_string(),
                digest,
                created_at,
            });
        }
        sort_newest_first(&mut items);
        Ok(items)
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<bool> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(anyhow!("tag is required"));
        }
        let repo_path = encode_repository(repository)?;
        let Some(digest) = self
            .tag_digest(&repo_path, tag)
            .await
            .with_context(|| format!("resolve digest for {}:{tag}", repository.trim()))?
        else {
            return Ok(false);
        };

        let resp = self
            .http
            .delete(self.url(&repo_path, &format!("manifests/{}", escape_segment(&digest))))
            .send()
            .await
            .context("delete manifest request")?;
        match resp.status() {
            StatusCode::ACCEPTED => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(anyhow!(
                    "delete manifest failed: status={} body={}",
                    status.as_u16(),
                    body.trim()
                ))
            }
        }
    }
}

/// Dated tags first, newest on top; ties and undated tags by tag name, descending.
pub fn sort_newest_first(items: &mut [TagInfo]) {
    items.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(x), Some(y)) if x != y => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        _ => b.tag.cmp(&a.tag),
    });
}

pub fn has_tag(tags: &[TagInfo], tag: &str) -> bool {
    let tag = tag.trim();
    !tag.is_empty() && tags.iter().any(|t| t.tag.trim() == tag)
}

/// Repository path inside the internal registry, or empty when `image_repository`
/// lives on another host.
pub fn repository_path(image_repository: &str, internal_host: &str) -> String {
    let repository = image_repository.trim();
    let repository = repository
        .strip_prefix("http://")
        .or_else(|| repository.strip_prefix("https://"))
        .unwrap_or(repository);
    let host = internal_host.trim();
    if host.is_empty() {
        return repository.to_string();
    }
    repository
        .strip_prefix(&format!("{host}/"))
        .map(|path| path.trim().to_string())
        .unwrap_or_default()
}

fn encode_repository(repository: &str) -> Result<String> {
    let repository = repository.trim();
    if repository.is_empty() {
        return Err(anyhow!("repository is required"));
    }
    let mut parts = vec![];
    for part in repository.split('/') {
        let part = part.trim();
        if part.is_empty() {
            return Err(anyhow!("repository {repository:?} is invalid"));
        }
        parts.push(escape_segment(part));
    }
    Ok(parts.join("/"))
}

fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'@'
            | b'$' | b'&' | b'+' | b'=' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
