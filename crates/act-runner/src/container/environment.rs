// The execution environment seen by steps (a container or the host), and the
// driver that creates containers, networks and volumes.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::LineHandler;

/// Everything needed to create one container.
#[derive(Clone, Default)]
pub struct ContainerInput {
    pub name: String,
    pub image: String,
    pub username: String,
    pub password: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub binds: Vec<String>,
    /// Named volume → mount path.
    pub mounts: BTreeMap<String, String>,
    pub ports: Vec<String>,
    pub network_mode: String,
    pub network_aliases: Vec<String>,
    pub privileged: bool,
    pub userns_mode: String,
    pub platform: String,
    pub options: String,
    pub auto_remove: bool,
    /// Receives the container's own output when started attached.
    pub output: Option<LineHandler>,
}

impl std::fmt::Debug for ContainerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerInput")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("entrypoint", &self.entrypoint)
            .field("cmd", &self.cmd)
            .field("working_dir", &self.working_dir)
            .field("binds", &self.binds)
            .field("mounts", &self.mounts)
            .field("network_mode", &self.network_mode)
            .field("network_aliases", &self.network_aliases)
            .finish_non_exhaustive()
    }
}

/// A command run inside an environment.
#[derive(Clone, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub user: String,
    pub workdir: String,
    /// Receives stdout and stderr, one line at a time.
    pub on_line: Option<LineHandler>,
}

/// A file written into an environment by [`ExecutionEnvironment::copy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the copy destination.
    pub name: String,
    pub mode: u32,
    pub body: String,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, mode: u32, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode,
            body: body.into(),
        }
    }
}

/// Where steps run. All operations are idempotent from the caller's view.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn name(&self) -> &str;

    async fn pull(&self, force: bool, cancel: CancellationToken) -> Result<()>;

    async fn create(&self, cap_add: &[String], cap_drop: &[String], cancel: CancellationToken) -> Result<()>;

    /// Start the environment. `attach` waits for the main process and fails on
    /// a non-zero exit.
    async fn start(&self, attach: bool, cancel: CancellationToken) -> Result<()>;

    /// Run a command; a non-zero exit code is an error.
    async fn exec(&self, request: ExecRequest, cancel: CancellationToken) -> Result<()>;

    /// Write `files` under the directory `dest`.
    async fn copy(&self, dest: &str, files: Vec<FileEntry>, cancel: CancellationToken) -> Result<()>;

    /// Copy the host directory `src` into `dest`.
    async fn copy_dir(&self, dest: &str, src: &Path, use_gitignore: bool, cancel: CancellationToken) -> Result<()>;

    /// Read one file out of the environment; `None` when it does not exist.
    async fn read_file(&self, path: &str, cancel: CancellationToken) -> Result<Option<String>>;

    /// Environment variables baked into the image.
    async fn image_env(&self, _cancel: CancellationToken) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn remove(&self, cancel: CancellationToken) -> Result<()>;

    /// Release driver-side resources; called exactly once at the end of a job.
    async fn close(&self) -> Result<()>;

    /// Translate a host path into the environment's view of it.
    fn to_container_path(&self, host_path: &Path) -> String;

    /// Directory holding `workflow/event.json` and the file-command files.
    fn act_path(&self) -> String;

    fn path_variable_name(&self) -> &'static str {
        "PATH"
    }

    fn default_path(&self) -> String {
        act_common::constants::container::DEFAULT_PATH.to_string()
    }

    fn join_path_variable(&self, segments: &[String]) -> String {
        segments
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Values for the `runner` context (`os`, `arch`, `temp`, `tool_cache`).
    fn runner_context(&self) -> HashMap<String, String>;

    fn is_host(&self) -> bool {
        false
    }
}

/// Creates containers and manages the networks and volumes around them.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// A handle for the described container. `None` when the driver cannot
    /// produce one.
    fn new_container(&self, input: ContainerInput) -> Option<Arc<dyn ExecutionEnvironment>>;

    async fn create_network(&self, name: &str, cancel: CancellationToken) -> Result<()>;

    async fn remove_network(&self, name: &str, cancel: CancellationToken) -> Result<()>;

    async fn remove_volume(&self, name: &str, force: bool, cancel: CancellationToken) -> Result<()>;
}
