// ContainerDriver backed by the docker command line.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::constants::{container as paths, Architecture, CURRENT_ARCHITECTURE};
use act_common::process_invoker::split_args;
use act_common::{ProcessInvoker, ProcessRequest};

use super::environment::{
    ContainerDriver, ContainerInput, ExecRequest, ExecutionEnvironment, FileEntry,
};

/// Thin wrapper running `docker <args>`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker_path: PathBuf,
    /// `DOCKER_HOST` for the CLI, when the daemon is not the default one.
    host: Option<String>,
}

impl DockerCli {
    /// Locate `docker` on the PATH.
    pub fn new(daemon_socket: &str) -> Result<Self> {
        let docker_path = which::which("docker").context("docker executable not found on PATH")?;
        Ok(Self::with_path(docker_path, daemon_socket))
    }

    pub fn with_path(docker_path: impl Into<PathBuf>, daemon_socket: &str) -> Self {
        let host = match daemon_socket {
            "" | paths::NO_DOCKER_SOCKET => None,
            socket if socket.contains("://") => Some(socket.to_string()),
            socket => Some(format!("unix://{socket}")),
        };
        Self {
            docker_path: docker_path.into(),
            host,
        }
    }

    fn request(&self, args: Vec<String>) -> ProcessRequest {
        let mut request = ProcessRequest::new(self.docker_path.to_string_lossy(), args);
        if let Some(host) = &self.host {
            request
                .environment
                .insert("DOCKER_HOST".to_string(), host.clone());
        }
        request
    }

    /// Run a docker command and return its trimmed stdout.
    pub async fn run(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<String> {
        let out = self.run_raw(args, None, cancel).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn run_raw(&self, args: Vec<String>, stdin: Option<Vec<u8>>, cancel: &CancellationToken) -> Result<Vec<u8>> {
        tracing::debug!(target: "docker", "docker {}", args.join(" "));
        let mut request = self.request(args);
        request.stdin = stdin;
        ProcessInvoker::capture(&request, cancel.clone()).await
    }

    /// Run a docker command streaming output lines to `on_line`; a non-zero exit is an error.
    async fn run_streaming(&self, args: Vec<String>, on_line: Option<act_common::LineHandler>, cancel: &CancellationToken) -> Result<()> {
        let request = self.request(args);
        let mut invoker = ProcessInvoker::new();
        if let Some(handler) = on_line {
            invoker = invoker.on_stdout(handler.clone()).on_stderr(handler);
        }
        invoker.execute_checked(&request, cancel.clone()).await
    }
}

fn is_missing(err: &anyhow::Error) -> bool {
    let message = format!("{err:#}");
    message.contains("No such") || message.contains("Could not find the file") || message.contains("not found")
}

/// Registry host of an image reference, `None` for Docker Hub.
fn registry_of(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// Tar archive holding `files`, paths relative to the archive root.
fn tar_files(files: &[FileEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.body.len() as u64);
        header.set_mode(file.mode);
        header.set_cksum();
        builder
            .append_data(&mut header, &file.name, file.body.as_bytes())
            .with_context(|| format!("failed to archive {}", file.name))?;
    }
    builder.into_inner().context("failed to finish archive")
}

/// Tar archive of the directory `src`, optionally honouring `.gitignore`.
pub(crate) async fn tar_dir(src: &Path, use_gitignore: bool, cancel: &CancellationToken) -> Result<Vec<u8>> {
    let files = list_files(src, use_gitignore, cancel).await?;
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    for relative in files {
        let full = src.join(&relative);
        if full.is_dir() {
            continue;
        }
        builder
            .append_path_with_name(&full, &relative)
            .with_context(|| format!("failed to archive {}", full.display()))?;
    }
    builder.into_inner().context("failed to finish archive")
}

/// Files under `src`, relative to it. With `use_gitignore` inside a git
/// work tree, ignored files are left out.
pub(crate) async fn list_files(src: &Path, use_gitignore: bool, cancel: &CancellationToken) -> Result<Vec<PathBuf>> {
    if use_gitignore && src.join(".git").exists() {
        if let Ok(git) = which::which("git") {
            let request = ProcessRequest::new(
                git.to_string_lossy(),
                ["ls-files", "-z", "--cached", "--others", "--exclude-standard"],
            )
            .in_dir(src);
            match ProcessInvoker::capture(&request, cancel.clone()).await {
                Ok(out) => {
                    let mut files: Vec<PathBuf> = out
                        .split(|b| *b == 0)
                        .filter(|p| !p.is_empty())
                        .map(|p| PathBuf::from(String::from_utf8_lossy(p).to_string()))
                        .filter(|p| src.join(p).exists())
                        .collect();
                    files.extend(git_dir_files(src));
                    return Ok(files);
                }
                Err(e) => tracing::debug!(target: "container", "git ls-files failed, copying everything: {:#}", e),
            }
        }
    }
    Ok(walkdir::WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
        .filter_map(|entry| entry.path().strip_prefix(src).ok().map(Path::to_path_buf))
        .collect())
}

/// The `.git` directory itself is never listed by `git ls-files` but is part of a checkout.
fn git_dir_files(src: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(src.join(".git"))
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| !entry.file_type().is_dir())
        .filter_map(|entry| entry.path().strip_prefix(src).ok().map(Path::to_path_buf))
        .collect()
}

/// Contents of the first regular file in a tar stream.
fn first_file_in_tar(bytes: &[u8]) -> Result<Option<String>> {
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries().context("invalid archive")? {
        let mut entry = entry.context("invalid archive entry")?;
        if entry.header().entry_type().is_file() {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .context("failed to read archive entry")?;
            return Ok(Some(content));
        }
    }
    Ok(None)
}

pub struct DockerCliDriver {
    cli: DockerCli,
}

impl DockerCliDriver {
    pub fn new(cli: DockerCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ContainerDriver for DockerCliDriver {
    fn new_container(&self, input: ContainerInput) -> Option<Arc<dyn ExecutionEnvironment>> {
        if input.image.is_empty() || input.name.is_empty() {
            return None;
        }
        Some(Arc::new(DockerContainer {
            cli: self.cli.clone(),
            input,
        }))
    }

    async fn create_network(&self, name: &str, cancel: CancellationToken) -> Result<()> {
        let existing = self
            .cli
            .run(
                vec!["network".into(), "ls".into(), "-q".into(), "--filter".into(), format!("name=^{name}$")],
                &cancel,
            )
            .await?;
        if !existing.is_empty() {
            tracing::debug!(target: "docker", "Network {} already exists", name);
            return Ok(());
        }
        self.cli
            .run(vec!["network".into(), "create".into(), name.to_string()], &cancel)
            .await
            .with_context(|| format!("failed to create network {name}"))?;
        Ok(())
    }

    async fn remove_network(&self, name: &str, cancel: CancellationToken) -> Result<()> {
        match self
            .cli
            .run(vec!["network".into(), "rm".into(), name.to_string()], &cancel)
            .await
        {
            Err(e) if !is_missing(&e) => Err(e.context(format!("failed to remove network {name}"))),
            _ => Ok(()),
        }
    }

    async fn remove_volume(&self, name: &str, force: bool, cancel: CancellationToken) -> Result<()> {
        let mut args = vec!["volume".to_string(), "rm".to_string()];
        if force {
            args.push("--force".into());
        }
        args.push(name.to_string());
        match self.cli.run(args, &cancel).await {
            Err(e) if !is_missing(&e) => Err(e.context(format!("failed to remove volume {name}"))),
            _ => Ok(()),
        }
    }
}

/// One container managed through the docker CLI, addressed by name.
pub struct DockerContainer {
    cli: DockerCli,
    input: ContainerInput,
}

impl DockerContainer {
    fn create_args(&self, cap_add: &[String], cap_drop: &[String]) -> Vec<String> {
        let input = &self.input;
        let mut args = vec!["create".to_string(), "--name".to_string(), input.name.clone()];
        let mut push = |flag: &str, value: &str| {
            args.push(flag.to_string());
            args.push(value.to_string());
        };

        if let Some(entrypoint) = input.entrypoint.first() {
            push("--entrypoint", entrypoint);
        }
        if !input.working_dir.is_empty() {
            push("--workdir", &input.working_dir);
        }
        for (key, value) in &input.env {
            push("--env", &format!("{key}={value}"));
        }
        for bind in &input.binds {
            push("--volume", bind);
        }
        for (volume, target) in &input.mounts {
            push("--mount", &format!("type=volume,source={volume},target={target}"));
        }
        for port in &input.ports {
            push("--publish", port);
        }
        if !input.network_mode.is_empty() {
            push("--network", &input.network_mode);
        }
        if !matches!(input.network_mode.as_str(), "" | "host" | "bridge" | "default" | "none") {
            for alias in &input.network_aliases {
                push("--network-alias", alias);
            }
        }
        if !input.userns_mode.is_empty() {
            push("--userns", &input.userns_mode);
        }
        if !input.platform.is_empty() {
            push("--platform", &input.platform);
        }
        for cap in cap_add {
            push("--cap-add", cap);
        }
        for cap in cap_drop {
            push("--cap-drop", cap);
        }
        if input.privileged {
            args.push("--privileged".into());
        }
        if input.auto_remove {
            args.push("--rm".into());
        }
        args.extend(split_args(&input.options));
        args.push(input.image.clone());
        args.extend(input.entrypoint.iter().skip(1).cloned());
        args.extend(input.cmd.iter().cloned());
        args
    }

    async fn exists(&self, cancel: &CancellationToken) -> Result<bool> {
        let id = self
            .cli
            .run(
                vec!["ps".into(), "-aq".into(), "--filter".into(), format!("name=^{}$", self.input.name)],
                cancel,
            )
            .await?;
        Ok(!id.is_empty())
    }

    async fn image_present(&self, cancel: &CancellationToken) -> bool {
        self.cli
            .run(
                vec!["image".into(), "inspect".into(), "--format".into(), "{{.Id}}".into(), self.input.image.clone()],
                cancel,
            )
            .await
            .is_ok()
    }

    async fn login(&self, cancel: &CancellationToken) -> Result<()> {
        let mut args = vec!["login".to_string(), "--username".to_string(), self.input.username.clone(), "--password-stdin".to_string()];
        if let Some(registry) = registry_of(&self.input.image) {
            args.push(registry.to_string());
        }
        self.cli
            .run_raw(args, Some(self.input.password.clone().into_bytes()), cancel)
            .await
            .with_context(|| format!("docker login for {} failed", self.input.image))?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionEnvironment for DockerContainer {
    fn name(&self) -> &str {
        &self.input.name
    }

    async fn pull(&self, force: bool, cancel: CancellationToken) -> Result<()> {
        if !force && self.image_present(&cancel).await {
            tracing::debug!(target: "docker", "Image {} exists, skipping pull", self.input.image);
            return Ok(());
        }
        tracing::info!(target: "docker", "🐳  docker pull image={} platform={} username={} forcePull={}",
            self.input.image, self.input.platform, self.input.username, force);
        if !self.input.username.is_empty() {
            self.login(&cancel).await?;
        }
        let mut args = vec!["pull".to_string()];
        if !self.input.platform.is_empty() {
            args.push("--platform".into());
            args.push(self.input.platform.clone());
        }
        args.push(self.input.image.clone());
        self.cli
            .run_streaming(args, None, &cancel)
            .await
            .with_context(|| format!("failed to pull image {}", self.input.image))
    }

    async fn create(&self, cap_add: &[String], cap_drop: &[String], cancel: CancellationToken) -> Result<()> {
        if self.exists(&cancel).await? {
            tracing::debug!(target: "docker", "Found existing container {}", self.input.name);
            return Ok(());
        }
        tracing::info!(target: "docker", "🐳  docker create image={} entrypoint={:?} cmd={:?} network={:?}",
            self.input.image, self.input.entrypoint, self.input.cmd, self.input.network_mode);
        self.cli
            .run(self.create_args(cap_add, cap_drop), &cancel)
            .await
            .with_context(|| format!("failed to create container {}", self.input.name))?;
        Ok(())
    }

    async fn start(&self, attach: bool, cancel: CancellationToken) -> Result<()> {
        tracing::info!(target: "docker", "🐳  docker run image={} entrypoint={:?} cmd={:?}",
            self.input.image, self.input.entrypoint, self.input.cmd);
        if attach {
            return self
                .cli
                .run_streaming(
                    vec!["start".into(), "--attach".into(), self.input.name.clone()],
                    self.input.output.clone(),
                    &cancel,
                )
                .await
                .with_context(|| format!("container {} failed", self.input.name));
        }
        self.cli
            .run(vec!["start".into(), self.input.name.clone()], &cancel)
            .await
            .with_context(|| format!("failed to start container {}", self.input.name))?;
        Ok(())
    }

    async fn exec(&self, request: ExecRequest, cancel: CancellationToken) -> Result<()> {
        tracing::debug!(target: "docker", "Exec command '{:?}' in {}", request.command, self.input.name);
        let mut args = vec!["exec".to_string()];
        let mut env: Vec<_> = request.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        if !request.user.is_empty() {
            args.push("--user".into());
            args.push(request.user.clone());
        }
        if !request.workdir.is_empty() {
            args.push("--workdir".into());
            args.push(request.workdir.clone());
        }
        args.push(self.input.name.clone());
        args.extend(request.command.iter().cloned());
        self.cli.run_streaming(args, request.on_line.clone(), &cancel).await
    }

    async fn copy(&self, dest: &str, files: Vec<FileEntry>, cancel: CancellationToken) -> Result<()> {
        let archive = tar_files(&files)?;
        self.exec(
            ExecRequest {
                command: vec!["mkdir".into(), "-p".into(), dest.to_string()],
                ..ExecRequest::default()
            },
            cancel.clone(),
        )
        .await?;
        self.cli
            .run_raw(
                vec!["cp".into(), "-".into(), format!("{}:{}", self.input.name, dest)],
                Some(archive),
                &cancel,
            )
            .await
            .with_context(|| format!("failed to copy files into {}:{}", self.input.name, dest))?;
        Ok(())
    }

    async fn copy_dir(&self, dest: &str, src: &Path, use_gitignore: bool, cancel: CancellationToken) -> Result<()> {
        tracing::debug!(target: "docker", "Writing tarball of {} to {}:{}", src.display(), self.input.name, dest);
        let archive = tar_dir(src, use_gitignore, &cancel).await?;
        self.exec(
            ExecRequest {
                command: vec!["mkdir".into(), "-p".into(), dest.to_string()],
                ..ExecRequest::default()
            },
            cancel.clone(),
        )
        .await?;
        self.cli
            .run_raw(
                vec!["cp".into(), "-".into(), format!("{}:{}", self.input.name, dest)],
                Some(archive),
                &cancel,
            )
            .await
            .with_context(|| format!("failed to copy {} into {}", src.display(), self.input.name))?;
        Ok(())
    }

    async fn read_file(&self, path: &str, cancel: CancellationToken) -> Result<Option<String>> {
        match self
            .cli
            .run_raw(vec!["cp".into(), format!("{}:{}", self.input.name, path), "-".into()], None, &cancel)
            .await
        {
            Ok(archive) => first_file_in_tar(&archive),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.context(format!("failed to read {path} from {}", self.input.name))),
        }
    }

    async fn image_env(&self, cancel: CancellationToken) -> Result<HashMap<String, String>> {
        let raw = self
            .cli
            .run(
                vec!["image".into(), "inspect".into(), "--format".into(), "{{json .Config.Env}}".into(), self.input.image.clone()],
                &cancel,
            )
            .await?;
        let entries: Option<Vec<String>> =
            serde_json::from_str(&raw).map_err(|e| anyhow!("unexpected image env '{}': {}", raw, e))?;
        Ok(entries
            .unwrap_or_default()
            .into_iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect())
    }

    async fn remove(&self, cancel: CancellationToken) -> Result<()> {
        tracing::debug!(target: "docker", "Removing container {}", self.input.name);
        match self
            .cli
            .run(vec!["rm".into(), "--force".into(), "--volumes".into(), self.input.name.clone()], &cancel)
            .await
        {
            Err(e) if !is_missing(&e) => Err(e.context(format!("failed to remove container {}", self.input.name))),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn to_container_path(&self, host_path: &Path) -> String {
        host_path.to_string_lossy().replace('\\', "/")
    }

    fn act_path(&self) -> String {
        paths::ACT_PATH.to_string()
    }

    fn runner_context(&self) -> HashMap<String, String> {
        let arch = if self.input.platform.is_empty() {
            CURRENT_ARCHITECTURE
        } else {
            Architecture::from_platform(&self.input.platform)
        };
        HashMap::from([
            ("os".to_string(), "Linux".to_string()),
            ("arch".to_string(), arch.to_string()),
            ("temp".to_string(), paths::RUNNER_TEMP.to_string()),
            ("tool_cache".to_string(), paths::HOSTED_TOOL_CACHE.to_string()),
        ])
    }
}
