// On-disk cache of fetched action and reusable-workflow sources.
//
// Every reference maps to `<root>/<sanitized reference>`. An existing
// directory is trusted forever; only missing directories are fetched.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use act_common::constants::variables;

use crate::config::{Config, FetchLockMode};
use crate::error::RunnerError;
use crate::reference::safe_filename;

/// One clone request handed to a [`SourceFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub reference: String,
    pub target_dir: PathBuf,
    /// Empty when the fetch must be anonymous.
    pub token: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested ref is an abbreviated commit SHA.
    #[error("short SHA references are not supported, use {full_sha}")]
    ShortRef { full_sha: String },

    /// The cached checkout diverged from the remote.
    #[error("non-fast-forward update for {0}")]
    ForceNeeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Clones a repository at a ref into a directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn clone_source(
        &self,
        request: &FetchRequest,
        cancel: CancellationToken,
    ) -> Result<(), FetchError>;
}

/// Resolve the cache root.
///
/// Priority: explicit configuration, `XDG_CACHE_HOME`, `~/.cache`, the
/// absolute current directory, then the system temp directory. The result is
/// always suffixed with `act`.
pub fn cache_root(config_override: Option<&Path>) -> PathBuf {
    if let Some(dir) = config_override.filter(|d| !d.as_os_str().is_empty()) {
        return dir.to_path_buf();
    }
    let base = std::env::var_os(variables::XDG_CACHE_HOME)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(std::env::temp_dir);
    base.join("act")
}

/// Fetch exclusivity: one process-wide mutex, or one mutex per target path.
pub enum FetchLocks {
    Global(Arc<Mutex<()>>),
    PerPath(DashMap<PathBuf, Arc<Mutex<()>>>),
}

/// Held for the duration of one fetch. A per-path entry leaves the table
/// once its last holder or waiter is gone.
pub struct FetchGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    entry: Option<(&'a DashMap<PathBuf, Arc<Mutex<()>>>, PathBuf)>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some((table, path)) = self.entry.take() {
            table.remove_if(&path, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

impl FetchLocks {
    pub fn new(mode: FetchLockMode) -> Self {
        match mode {
            FetchLockMode::Global => FetchLocks::Global(Arc::new(Mutex::new(()))),
            FetchLockMode::PerPath => FetchLocks::PerPath(DashMap::new()),
        }
    }

    pub async fn acquire(&self, target: &Path) -> FetchGuard<'_> {
        let (mutex, entry) = match self {
            FetchLocks::Global(mutex) => (mutex.clone(), None),
            FetchLocks::PerPath(table) => {
                let mutex = table
                    .entry(target.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone();
                (mutex, Some((table, target.to_path_buf())))
            }
        };
        FetchGuard {
            guard: Some(mutex.lock_owned().await),
            entry,
        }
    }

    /// Number of paths with a live per-path lock.
    pub fn tracked_paths(&self) -> usize {
        match self {
            FetchLocks::Global(_) => 0,
            FetchLocks::PerPath(table) => table.len(),
        }
    }
}

/// The source cache shared by every run context of a process.
pub struct SourceCache {
    root: PathBuf,
    locks: FetchLocks,
    fetcher: Arc<dyn SourceFetcher>,
}

impl SourceCache {
    pub fn new(root: PathBuf, lock_mode: FetchLockMode, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            root,
            locks: FetchLocks::new(lock_mode),
            fetcher,
        }
    }

    pub fn from_config(config: &Config, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self::new(
            cache_root(config.action_cache_dir.as_deref()),
            config.fetch_lock,
            fetcher,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache directory for a raw reference string.
    pub fn dir_for(&self, raw_reference: &str) -> PathBuf {
        self.root.join(safe_filename(raw_reference))
    }

    /// Make sure `raw_reference` is present in the cache, fetching it if the
    /// directory does not exist yet. Returns the cache directory.
    pub async fn ensure(
        &self,
        raw_reference: &str,
        url: &str,
        reference: &str,
        token: &str,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let target_dir = self.dir_for(raw_reference);
        let _guard = self.locks.acquire(&target_dir).await;

        if target_dir.exists() {
            tracing::debug!(target: "cache", "Using cached {} at {}", raw_reference, target_dir.display());
            return Ok(target_dir);
        }

        tracing::info!(target: "cache", "☁  git clone '{}' # ref={}", url, reference);
        let request = FetchRequest {
            url: url.to_string(),
            reference: reference.to_string(),
            target_dir: target_dir.clone(),
            token: token.to_string(),
        };
        match self.fetcher.clone_source(&request, cancel).await {
            Ok(()) => Ok(target_dir),
            Err(FetchError::ShortRef { full_sha }) => Err(RunnerError::ShortRef {
                uses: raw_reference.to_string(),
                reference: reference.to_string(),
                full_sha,
            }
            .into()),
            Err(FetchError::ForceNeeded(_)) => {
                tracing::warn!(
                    target: "cache",
                    "{}",
                    RunnerError::ForceNeeded {
                        reference: raw_reference.to_string()
                    }
                );
                Ok(target_dir)
            }
            Err(FetchError::Other(e)) => {
                Err(e.context(format!("failed to fetch {} from {}", raw_reference, url)))
            }
        }
    }
}
