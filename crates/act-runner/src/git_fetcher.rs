// SourceFetcher backed by the git command line.
//
// Clones land in a temporary sibling directory that is renamed into place
// once the requested ref is checked out, so a failed clone never leaves a
// directory the cache would trust.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use act_common::{ProcessInvoker, ProcessRequest};

use crate::source_cache::{FetchError, FetchRequest, SourceFetcher};

pub struct GitCliFetcher {
    git: PathBuf,
}

impl GitCliFetcher {
    /// Locate `git` on the PATH.
    pub fn new() -> Result<Self> {
        let git = which::which("git").context("git executable not found on PATH")?;
        Ok(Self { git })
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        let mut request = ProcessRequest::new(self.git.to_string_lossy(), args.iter().copied());
        request
            .environment
            .insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        if let Some(dir) = dir {
            request = request.in_dir(dir);
        }
        let out = ProcessInvoker::capture(&request, cancel.clone()).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Resolve `reference` to a commit sha: remote branch, then tag, then raw revision.
    async fn resolve(&self, dir: &Path, reference: &str, cancel: &CancellationToken) -> Result<String> {
        let candidates = [
            format!("refs/remotes/origin/{reference}^{{commit}}"),
            format!("refs/tags/{reference}^{{commit}}"),
            format!("{reference}^{{commit}}"),
        ];
        for candidate in &candidates {
            if let Ok(sha) = self
                .git(Some(dir), &["rev-parse", "--verify", "--quiet", candidate], cancel)
                .await
            {
                if !sha.is_empty() {
                    return Ok(sha);
                }
            }
        }
        Err(anyhow!("unable to resolve ref '{}'", reference))
    }

    async fn update_existing(&self, request: &FetchRequest, cancel: &CancellationToken) -> Result<(), FetchError> {
        let dir = request.target_dir.as_path();
        match self
            .git(Some(dir), &["fetch", "--tags", "origin"], cancel)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                let message = format!("{e:#}");
                if message.contains("non-fast-forward") || message.contains("[rejected]") {
                    return Err(FetchError::ForceNeeded(request.reference.clone()));
                }
                return Err(FetchError::Other(e));
            }
        }
        self.checkout(dir, &request.reference, cancel).await
    }

    async fn checkout(&self, dir: &Path, reference: &str, cancel: &CancellationToken) -> Result<(), FetchError> {
        let sha = self.resolve(dir, reference, cancel).await?;
        if is_short_sha(reference, &sha) {
            return Err(FetchError::ShortRef { full_sha: sha });
        }
        self.git(Some(dir), &["checkout", "--force", "--detach", &sha], cancel)
            .await
            .with_context(|| format!("failed to checkout {reference}"))?;
        Ok(())
    }
}

/// `reference` abbreviates `sha` without being the full sha.
fn is_short_sha(reference: &str, sha: &str) -> bool {
    reference.len() < sha.len()
        && reference.len() >= 4
        && reference.chars().all(|c| c.is_ascii_hexdigit())
        && sha.starts_with(&reference.to_ascii_lowercase())
}

/// The clone URL with `token` as basic-auth password. Empty tokens clone anonymously.
fn authenticated_url(url: &str, token: &str) -> Result<String> {
    if token.is_empty() {
        return Ok(url.to_string());
    }
    let mut parsed = url::Url::parse(url).with_context(|| format!("invalid clone url '{url}'"))?;
    parsed
        .set_username("token")
        .and_then(|_| parsed.set_password(Some(token)))
        .map_err(|_| anyhow!("cannot embed credentials into '{}'", url))?;
    Ok(parsed.to_string())
}

#[async_trait]
impl SourceFetcher for GitCliFetcher {
    async fn clone_source(&self, request: &FetchRequest, cancel: CancellationToken) -> Result<(), FetchError> {
        if request.target_dir.join(".git").exists() {
            return self.update_existing(request, &cancel).await;
        }

        let parent = request
            .target_dir
            .parent()
            .ok_or_else(|| anyhow!("cache directory {} has no parent", request.target_dir.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let staging = parent.join(format!(".clone-{}", uuid::Uuid::new_v4().simple()));
        let staging_str = staging.to_string_lossy().to_string();

        let result = async {
            let url = authenticated_url(&request.url, &request.token)?;
            self.git(None, &["clone", "--no-checkout", "--quiet", &url, &staging_str], &cancel)
                .await
                .with_context(|| format!("git clone of {} failed", request.url))?;
            self.checkout(&staging, &request.reference, &cancel).await?;
            std::fs::rename(&staging, &request.target_dir).with_context(|| {
                format!("failed to move clone into {}", request.target_dir.display())
            })?;
            Ok::<(), FetchError>(())
        }
        .await;

        if result.is_err() && staging.exists() {
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                tracing::warn!(target: "cache", "Failed to remove {}: {}", staging.display(), e);
            }
        }
        result
    }
}
