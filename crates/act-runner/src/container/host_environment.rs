// Execution environment that runs steps directly on the host, used for
// self-hosted platforms.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use act_common::constants::CURRENT_ARCHITECTURE;
use act_common::{LineHandler, ProcessInvoker, ProcessRequest};

use super::docker_cli::list_files;
use super::environment::{ExecRequest, ExecutionEnvironment, FileEntry};

/// Scratch layout of one host job, all below `<cache root>/<random hex>`.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    name: String,
    scratch: PathBuf,
    path: PathBuf,
    act_path: PathBuf,
    tmp_dir: PathBuf,
    tool_cache: PathBuf,
    workdir: PathBuf,
    output: Option<LineHandlerDebug>,
}

#[derive(Clone)]
struct LineHandlerDebug(LineHandler);

impl std::fmt::Debug for LineHandlerDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LineHandler")
    }
}

impl HostEnvironment {
    /// Allocate a fresh scratch directory under `cache_root` and create its layout.
    pub fn create(name: &str, cache_root: &Path, workdir: &Path) -> Result<Self> {
        let mut random = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut random);
        let scratch = cache_root.join(hex::encode(random));

        let env = Self {
            name: name.to_string(),
            path: scratch.join("hostexecutor"),
            act_path: scratch.join("act"),
            tmp_dir: scratch.join("tmp"),
            tool_cache: cache_root.join("tool_cache"),
            workdir: workdir.to_path_buf(),
            scratch,
            output: None,
        };
        for dir in [&env.act_path, &env.path, &env.tmp_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(env)
    }

    pub fn with_output(mut self, output: LineHandler) -> Self {
        self.output = Some(LineHandlerDebug(output));
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for HostEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, _force: bool, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn create(&self, _cap_add: &[String], _cap_drop: &[String], _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _attach: bool, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, request: ExecRequest, cancel: CancellationToken) -> Result<()> {
        let Some((program, args)) = request.command.split_first() else {
            anyhow::bail!("empty command");
        };
        let workdir = if request.workdir.is_empty() {
            self.workdir.clone()
        } else {
            self.resolve(&request.workdir)
        };
        let mut process = ProcessRequest::new(program.clone(), args.iter().cloned()).in_dir(workdir);
        process.environment = request.env.clone();

        let mut invoker = ProcessInvoker::new();
        let handler = request
            .on_line
            .clone()
            .or_else(|| self.output.as_ref().map(|o| o.0.clone()));
        if let Some(handler) = handler {
            invoker = invoker.on_stdout(handler.clone()).on_stderr(handler);
        }
        invoker.execute_checked(&process, cancel).await
    }

    async fn copy(&self, dest: &str, files: Vec<FileEntry>, _cancel: CancellationToken) -> Result<()> {
        let dest = self.resolve(dest);
        for file in files {
            let target = dest.join(&file.name);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&target, file.body.as_bytes())
                .await
                .with_context(|| format!("failed to write {}", target.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(file.mode))
                    .await
                    .with_context(|| format!("failed to set mode of {}", target.display()))?;
            }
        }
        Ok(())
    }

    async fn copy_dir(&self, dest: &str, src: &Path, use_gitignore: bool, cancel: CancellationToken) -> Result<()> {
        let dest = self.resolve(dest);
        if dest == src {
            return Ok(());
        }
        for relative in list_files(src, use_gitignore, &cancel).await? {
            let from = src.join(&relative);
            let to = dest.join(&relative);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            tokio::fs::copy(&from, &to)
                .await
                .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        }
        Ok(())
    }

    async fn read_file(&self, path: &str, _cancel: CancellationToken) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {path}")),
        }
    }

    async fn remove(&self, _cancel: CancellationToken) -> Result<()> {
        tracing::debug!(target: "container", "Removing host scratch directory {}", self.scratch.display());
        match tokio::fs::remove_dir_all(&self.scratch).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("failed to remove {}", self.scratch.display()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn to_container_path(&self, host_path: &Path) -> String {
        host_path.to_string_lossy().into_owned()
    }

    fn act_path(&self) -> String {
        self.act_path.to_string_lossy().into_owned()
    }

    fn default_path(&self) -> String {
        std::env::var(act_common::constants::variables::PATH).unwrap_or_default()
    }

    fn runner_context(&self) -> HashMap<String, String> {
        let os = match std::env::consts::OS {
            "linux" => "Linux",
            "macos" => "macOS",
            "windows" => "Windows",
            other => other,
        };
        HashMap::from([
            ("os".to_string(), os.to_string()),
            ("arch".to_string(), CURRENT_ARCHITECTURE.to_string()),
            ("temp".to_string(), self.tmp_dir.to_string_lossy().into_owned()),
            ("tool_cache".to_string(), self.tool_cache.to_string_lossy().into_owned()),
        ])
    }

    fn is_host(&self) -> bool {
        true
    }
}
