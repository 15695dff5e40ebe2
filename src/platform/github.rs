//! GitHub adapter
//!
//! Resource names look like `github://owner/repo/ref[/selector]`. `ref` may
//! be a release tag, branch, tag or commit — resolved in that order — or
//! `latest`, which falls back to the latest release and then the default
//! branch. The selector picks what to fetch: `tarball`/`zipball`, a release
//! asset glob, or a repo-relative file served from the raw host; it defaults
//! to `tarball`.
//!
//! Every API GET goes through the disk cache as a conditional request:
//! the cached `Date` feeds `If-Modified-Since` and a `304` replays the
//! cached payload. Successful responses are long-cached, 4xx short-cached.

use std::sync::Once;
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, DATE, IF_MODIFIED_SINCE};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::engine::Engine;
use crate::core::source::{Source, SourceKind};
use crate::error::{Error, Result};
use crate::infra::cache::CacheEntry;
use crate::platform::Platform;

const GITHUB: &str = "https://github.com";
const GITHUB_API: &str = "https://api.github.com";
const GITHUB_RAW: &str = "https://raw.githubusercontent.com";

/// Secret name the API token is stored under.
const TOKEN_SECRET: &str = "platform.github.token";

/// Cached responses younger than this are returned without revalidation.
const FRESH_WINDOW_SECS: i64 = 10;

/// Quota polls before giving up on a rate-limited API.
const RATE_LIMIT_ATTEMPTS: u32 = 60;

static RATE_LIMIT_WARNED: Once = Once::new();

/// Parsed resource name parts. `ref_name` is `None` for `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResName {
    pub owner: String,
    pub repo: String,
    pub ref_name: Option<String>,
    pub selector: String,
}

impl ResName {
    pub fn parse(res_name: &str) -> Result<ResName> {
        let body = res_name
            .strip_prefix("github://")
            .ok_or_else(|| Error::Invalid(format!("not a github resource: {res_name}")))?;

        let mut parts = body.splitn(4, '/');
        let owner = parts.next().filter(|s| !s.is_empty());
        let repo = parts.next().filter(|s| !s.is_empty());
        let ref_name = parts.next().filter(|s| !s.is_empty());
        let selector = parts.next().filter(|s| !s.is_empty());

        match (owner, repo, ref_name) {
            (Some(owner), Some(repo), Some(ref_name)) => Ok(ResName {
                owner: owner.to_string(),
                repo: repo.to_string(),
                ref_name: (ref_name != "latest").then(|| ref_name.to_string()),
                selector: selector.unwrap_or("tarball").to_string(),
            }),
            _ => Err(Error::Invalid(format!(
                "expected github://owner/repo/ref[/selector], got {res_name}"
            ))),
        }
    }

    /// Inverse of `parse` for legal inputs.
    pub fn format(&self) -> String {
        format!(
            "github://{}/{}/{}/{}",
            self.owner,
            self.repo,
            self.ref_name.as_deref().unwrap_or("latest"),
            self.selector
        )
    }
}

/// Resolved reference: the concrete ref plus its revision token.
#[derive(Debug, Clone)]
struct RefInfo {
    ref_name: Option<String>,
    revision: String,
    mtime: Option<i64>,
    assets: Vec<Asset>,
}

#[derive(Debug, Clone)]
struct Asset {
    name: String,
    url: String,
    updated_at: Option<String>,
}

fn parse_github_date(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

fn release_from(payload: &Value) -> Option<RefInfo> {
    let tag = payload["tag_name"].as_str()?;
    let assets = payload["assets"]
        .as_array()
        .map(|assets| {
            assets
                .iter()
                .filter_map(|a| {
                    Some(Asset {
                        name: a["name"].as_str()?.to_string(),
                        url: a["browser_download_url"].as_str()?.to_string(),
                        updated_at: a["updated_at"].as_str().map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(RefInfo {
        ref_name: Some(tag.to_string()),
        revision: payload["created_at"].as_str()?.to_string(),
        mtime: None,
        assets,
    })
}

fn branch_from(payload: &Value, ref_name: &str) -> Option<RefInfo> {
    Some(RefInfo {
        ref_name: Some(ref_name.to_string()),
        revision: payload["commit"]["sha"].as_str()?.to_string(),
        mtime: payload["commit"]["commit"]["committer"]["date"]
            .as_str()
            .and_then(parse_github_date),
        assets: Vec::new(),
    })
}

fn tag_from(payload: &Value) -> Option<RefInfo> {
    Some(RefInfo {
        ref_name: None,
        revision: payload["object"]["sha"].as_str()?.to_string(),
        mtime: payload["tagger"]["date"].as_str().and_then(parse_github_date),
        assets: Vec::new(),
    })
}

fn commit_from(payload: &Value) -> Option<RefInfo> {
    Some(RefInfo {
        ref_name: None,
        revision: payload["sha"].as_str()?.to_string(),
        mtime: payload["commit"]["committer"]["date"]
            .as_str()
            .and_then(parse_github_date),
        assets: Vec::new(),
    })
}

pub struct GitHub;

impl GitHub {
    pub fn new() -> GitHub {
        GitHub
    }

    fn api_headers(&self, eng: &Engine, modified_since: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = eng.secrets.get(TOKEN_SECRET) {
            if let Ok(value) = HeaderValue::from_str(&format!("token {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(date) = modified_since {
            if let Ok(value) = HeaderValue::from_str(date) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }
        headers
    }

    /// Conditional GET against the REST API, through the disk cache.
    fn api_get(&self, eng: &Engine, path: &str) -> Result<(Value, u16)> {
        let cached = eng.cache.get(path);

        // A very recent entry short-circuits the request entirely.
        if let Some(entry) = &cached {
            let age_ok = entry
                .date
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                .map(|d| Utc::now().timestamp() - d.timestamp() < FRESH_WINDOW_SECS)
                .unwrap_or(false);
            if age_ok {
                return Ok((entry.payload.clone(), entry.status));
            }
        }

        let modified_since = cached.as_ref().and_then(|e| e.date.clone());

        let resp = loop {
            let headers = self.api_headers(eng, modified_since.as_deref());
            let resp = eng.http.get(&format!("{GITHUB_API}{path}"), headers)?;

            if resp.status() == StatusCode::FORBIDDEN {
                let remaining = resp
                    .headers()
                    .get("X-RateLimit-Remaining")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok());
                if remaining == Some(0) {
                    self.wait_rate_limit(eng)?;
                    continue;
                }
                // Any other permission error surfaces as-is.
                return Err(resp.error_for_status().unwrap_err().into());
            }
            break resp;
        };

        // Nothing changed since last time; replay the cached payload.
        if resp.status() == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                return Ok((entry.payload, entry.status));
            }
        }

        let status = resp.status().as_u16();
        let date = resp
            .headers()
            .get(DATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let payload: Value = resp.json().unwrap_or(Value::Null);

        eng.cache.set(
            path,
            &CacheEntry {
                payload: payload.clone(),
                date,
                status,
            },
            status < 400,
        )?;
        Ok((payload, status))
    }

    /// Poll the quota endpoint until the core rate limit replenishes.
    fn wait_rate_limit(&self, eng: &Engine) -> Result<()> {
        RATE_LIMIT_WARNED.call_once(|| {
            let mut msg = "GitHub rate limit reached, waiting...".to_string();
            if eng.secrets.get(TOKEN_SECRET).is_none() {
                msg.push_str(
                    " Store a token under \"platform.github.token\" to raise the limit.",
                );
            }
            warn!("{msg}");
        });

        for _ in 0..RATE_LIMIT_ATTEMPTS {
            sleep(Duration::from_secs(60));
            let headers = self.api_headers(eng, None);
            let resp = eng.http.get(&format!("{GITHUB_API}/rate_limit"), headers)?;
            let payload: Value = resp.json().unwrap_or(Value::Null);
            let remaining = payload["resources"]["core"]["remaining"]
                .as_i64()
                .unwrap_or(0);
            if remaining > 0 {
                return Ok(());
            }
        }
        Err(Error::Other(anyhow::anyhow!(
            "GitHub rate limit did not replenish"
        )))
    }

    fn exists(&self, eng: &Engine, path: &str, condition: bool) -> bool {
        condition
            && self
                .api_get(eng, path)
                .map(|(_, status)| status != 404)
                .unwrap_or(false)
    }

    /// Find the most specific missing object and fail with its name.
    fn not_found(
        &self,
        eng: &Engine,
        name: &ResName,
        with_selector: bool,
    ) -> Error {
        let ResName {
            owner,
            repo,
            ref_name,
            selector,
        } = name;
        let ref_str = ref_name.as_deref().unwrap_or("latest");

        let owner_exists = self.exists(eng, &format!("/orgs/{owner}"), true)
            || self.exists(eng, &format!("/users/{owner}"), true);
        let repo_exists =
            owner_exists && self.exists(eng, &format!("/repos/{owner}/{repo}"), true);
        let ref_exists = repo_exists
            && self.exists(
                eng,
                &format!("/repos/{owner}/{repo}/git/trees/{ref_str}"),
                with_selector,
            );

        if ref_exists {
            Error::NotFound(format!(
                "no GitHub file \"{selector}\" found for \"{owner}/{repo}:{ref_str}\""
            ))
        } else if repo_exists {
            Error::NotFound(format!(
                "no GitHub reference \"{ref_str}\" found for \"{owner}/{repo}\""
            ))
        } else if owner_exists {
            Error::NotFound(format!(
                "no GitHub repository \"{repo}\" found for \"{owner}\""
            ))
        } else {
            Error::NotFound(format!(
                "no GitHub user or organization \"{owner}\" found"
            ))
        }
    }

    /// Resolve a ref by trying release, branch, tag then commit.
    fn reference(&self, eng: &Engine, name: &ResName) -> Result<RefInfo> {
        if let Some(info) = self.release(eng, name)? {
            return Ok(info);
        }
        if let Some(info) = self.branch(eng, name)? {
            return Ok(info);
        }
        if let Some(info) = self.tag(eng, name)? {
            return Ok(info);
        }
        if let Some(info) = self.commit(eng, name)? {
            return Ok(info);
        }
        Err(self.not_found(eng, name, false))
    }

    fn release(&self, eng: &Engine, name: &ResName) -> Result<Option<RefInfo>> {
        let ResName { owner, repo, .. } = name;
        let path = match &name.ref_name {
            Some(ref_name) => format!("/repos/{owner}/{repo}/releases/tags/{ref_name}"),
            // Latest stable release when no ref given.
            None => format!("/repos/{owner}/{repo}/releases/latest"),
        };
        let (payload, status) = self.api_get(eng, &path)?;
        if status == 404 {
            return Ok(None);
        }
        Ok(release_from(&payload))
    }

    fn branch(&self, eng: &Engine, name: &ResName) -> Result<Option<RefInfo>> {
        let ResName { owner, repo, .. } = name;
        let ref_name = match &name.ref_name {
            Some(ref_name) => ref_name.clone(),
            None => {
                // No ref and no release: fall back to the default branch.
                let (payload, status) =
                    self.api_get(eng, &format!("/repos/{owner}/{repo}"))?;
                if status == 404 {
                    return Ok(None);
                }
                match payload["default_branch"].as_str() {
                    Some(branch) => branch.to_string(),
                    None => return Ok(None),
                }
            }
        };

        let (payload, status) = self.api_get(
            eng,
            &format!("/repos/{owner}/{repo}/branches/{ref_name}"),
        )?;
        if status == 404 {
            return Ok(None);
        }
        Ok(branch_from(&payload, &ref_name))
    }

    fn tag(&self, eng: &Engine, name: &ResName) -> Result<Option<RefInfo>> {
        let ref_name = match &name.ref_name {
            Some(ref_name) => ref_name,
            None => return Ok(None),
        };
        let ResName { owner, repo, .. } = name;
        let (payload, status) = self.api_get(
            eng,
            &format!("/repos/{owner}/{repo}/git/tags/{ref_name}"),
        )?;
        if status == 404 {
            return Ok(None);
        }
        Ok(tag_from(&payload))
    }

    fn commit(&self, eng: &Engine, name: &ResName) -> Result<Option<RefInfo>> {
        let ref_name = match &name.ref_name {
            Some(ref_name) => ref_name,
            None => return Ok(None),
        };
        let ResName { owner, repo, .. } = name;
        let (payload, status) = self.api_get(
            eng,
            &format!("/repos/{owner}/{repo}/commits/{ref_name}"),
        )?;
        if status == 404 {
            return Ok(None);
        }
        Ok(commit_from(&payload))
    }
}

impl Default for GitHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for GitHub {
    fn sources(&self, eng: &Engine, res_name: &str, res_id: i64) -> Result<Vec<Source>> {
        let name = ResName::parse(res_name)?;
        let info = self.reference(eng, &name)?;
        let ref_name = info
            .ref_name
            .clone()
            .or_else(|| name.ref_name.clone())
            .unwrap_or_else(|| "latest".to_string());
        let ResName { owner, repo, .. } = &name;

        // Repository archives
        if name.selector == "tarball" || name.selector == "zipball" {
            let (kind, ext) = if name.selector == "zipball" {
                (SourceKind::Zip, "zip")
            } else {
                (
                    SourceKind::Tar(crate::core::archive::Compression::Gzip),
                    "tar.gz",
                )
            };
            debug!(resource = res_name, %ref_name, "resolved repository archive");
            return Ok(vec![Source::new(
                format!("{owner}-{repo}-{ref_name}.{ext}"),
                format!("{GITHUB}/{owner}/{repo}/{}/{ref_name}", name.selector),
                res_name,
                res_id,
                Some(kind),
                info.mtime,
                1,
                Some(info.revision),
            )]);
        }

        // Release assets matching the selector glob
        if !info.assets.is_empty() {
            let glob = globset::GlobBuilder::new(&name.selector)
                .literal_separator(false)
                .build()
                .map_err(|e| Error::Invalid(format!("bad asset glob: {e}")))?
                .compile_matcher();
            let matched: Vec<Source> = info
                .assets
                .iter()
                .filter(|asset| glob.is_match(&asset.name))
                .map(|asset| {
                    Source::new(
                        asset.name.clone(),
                        asset.url.clone(),
                        res_name,
                        res_id,
                        None,
                        asset.updated_at.as_deref().and_then(parse_github_date),
                        0,
                        asset.updated_at.clone(),
                    )
                })
                .collect();
            if !matched.is_empty() {
                debug!(
                    resource = res_name,
                    assets = matched.len(),
                    "resolved release assets"
                );
                return Ok(matched);
            }
        }

        // Raw repository file
        debug!(resource = res_name, %ref_name, "resolved raw file");
        Ok(vec![Source::new(
            name.selector.clone(),
            format!("{GITHUB_RAW}/{owner}/{repo}/{ref_name}/{}", name.selector),
            res_name,
            res_id,
            None,
            info.mtime,
            0,
            Some(info.revision),
        )])
    }
}
