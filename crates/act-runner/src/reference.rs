// Parsing of action and reusable-workflow references, and the cache keys derived from them.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::RunnerError;

static ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^/@]+)/([^/@]+)(/([^@]*))?(@(.*))?$").expect("valid action regex"));

static WORKFLOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^/]+)/([^/]+)/\.([^/]+)/workflows/([^@]+)@(.*)$").expect("valid workflow regex")
});

/// Characters replaced by `-` when turning a raw reference into a directory name.
const PATH_HOSTILE: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Filesystem-safe cache key for a raw reference string.
///
/// The mapping is applied to the raw string, not to parsed fields, so the same
/// input always yields the same key. Distinct inputs may collide.
pub fn safe_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| if PATH_HOSTILE.contains(&c) { '-' } else { c })
        .collect()
}

fn with_scheme(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// A remote action reference: `[http(s)://host/]{org}/{repo}[/{path}]@{ref}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    /// Explicit host including scheme, when the reference carried one.
    pub url: Option<String>,
    pub org: String,
    pub repo: String,
    pub path: String,
    pub reference: String,
}

impl RemoteAction {
    /// Parse a step `uses:` value. A missing `@ref` or malformed segments is a
    /// [`RunnerError::MalformedReference`].
    pub fn parse(uses: &str) -> Result<RemoteAction> {
        let malformed = || RunnerError::MalformedReference {
            uses: uses.to_string(),
        };

        for scheme in ["https://", "http://"] {
            if let Some(rest) = uses.strip_prefix(scheme) {
                let (host, action) = rest.split_once('/').ok_or_else(malformed)?;
                let mut parsed = Self::parse_plain(action).ok_or_else(malformed)?;
                parsed.url = Some(format!("{scheme}{host}"));
                return Ok(parsed);
            }
        }
        Ok(Self::parse_plain(uses).ok_or_else(malformed)?)
    }

    fn parse_plain(action: &str) -> Option<RemoteAction> {
        let caps = ACTION_RE.captures(action)?;
        let reference = caps.get(6).map(|m| m.as_str()).unwrap_or_default();
        if reference.is_empty() {
            return None;
        }
        Some(RemoteAction {
            url: None,
            org: caps[1].to_string(),
            repo: caps[2].to_string(),
            path: caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
            reference: reference.to_string(),
        })
    }

    /// `https://{host}/{org}/{repo}`, using the explicit host when present.
    pub fn clone_url(&self, default_host: &str) -> String {
        let host = self.url.as_deref().unwrap_or(default_host);
        format!("{}/{}/{}", with_scheme(host), self.org, self.repo)
    }

    /// True for the canonical checkout action.
    pub fn is_checkout(&self) -> bool {
        self.org == "actions" && self.repo == "checkout"
    }

    /// `org/repo`, as exposed through `GITHUB_ACTION_REPOSITORY`.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    /// Pick the first candidate host whose clone URL answers HTTP 200.
    ///
    /// A 404 moves on to the next candidate; any other status is an error.
    /// With a single candidate (or an explicit host) no request is made.
    pub async fn available_clone_url(
        &self,
        candidates: &[String],
        client: &reqwest::Client,
    ) -> Result<String> {
        if self.url.is_some() || candidates.len() <= 1 {
            let host = candidates.first().map(String::as_str).unwrap_or("github.com");
            return Ok(self.clone_url(host));
        }

        for candidate in candidates {
            let url = self.clone_url(candidate);
            let response = client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("failed to probe {url}"))?;
            match response.status() {
                reqwest::StatusCode::OK => return Ok(url),
                reqwest::StatusCode::NOT_FOUND => continue,
                status => anyhow::bail!("unexpected http status code: {}", status.as_u16()),
            }
        }
        anyhow::bail!("no available url found")
    }
}

/// A remote reusable workflow: `{org}/{repo}/.{platform}/workflows/{filename}@{ref}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReusableWorkflowRef {
    pub platform: String,
    pub org: String,
    pub repo: String,
    pub filename: String,
    pub reference: String,
}

impl ReusableWorkflowRef {
    pub fn parse(uses: &str) -> Result<ReusableWorkflowRef> {
        let caps = WORKFLOW_RE
            .captures(uses)
            .ok_or_else(|| RunnerError::MalformedWorkflowReference {
                uses: uses.to_string(),
            })?;
        Ok(ReusableWorkflowRef {
            org: caps[1].to_string(),
            repo: caps[2].to_string(),
            platform: caps[3].to_string(),
            filename: caps[4].to_string(),
            reference: caps[5].to_string(),
        })
    }

    pub fn clone_url(&self, host: &str) -> String {
        format!("{}/{}/{}", with_scheme(host), self.org, self.repo)
    }

    /// Path of the workflow file inside the fetched repository.
    pub fn file_path(&self) -> String {
        format!(".{}/workflows/{}", self.platform, self.filename)
    }
}

/// Where a reusable-workflow job takes its workflow from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSource {
    /// Path relative to the caller's checkout, `./` stripped.
    Local(String),
    Remote(ReusableWorkflowRef),
}

impl WorkflowSource {
    pub fn parse(uses: &str) -> Result<WorkflowSource> {
        match uses.strip_prefix("./") {
            Some(path) => Ok(WorkflowSource::Local(path.to_string())),
            None => ReusableWorkflowRef::parse(uses).map(WorkflowSource::Remote),
        }
    }
}

/// Whether a checkout step targets the triggering repository at the triggering ref,
/// in which case the existing workspace is used instead of fetching.
pub fn is_local_checkout(
    action: &RemoteAction,
    with: &HashMap<String, String>,
    repository: &str,
    git_ref: &str,
) -> bool {
    if !action.is_checkout() {
        return false;
    }
    if with.get("repository").is_some_and(|r| r != repository) {
        return false;
    }
    if with.get("ref").is_some_and(|r| r != git_ref) {
        return false;
    }
    true
}
