// Runner configuration: a serde-deserializable record every job run reads from.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use act_common::constants::DEFAULT_CONTAINER_MAX_LIFETIME_SECS;

use crate::github_context::GitHubContext;

/// Granularity of the lock guarding source fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchLockMode {
    /// One lock for every fetch in the process.
    Global,
    /// One lock per cache directory.
    #[default]
    PerPath,
}

/// Runtime-only callback mapping `runs-on` labels to an image.
/// Returning `None` falls through to the static `platforms` table.
#[derive(Clone)]
pub struct PlatformPicker(pub Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>);

impl fmt::Debug for PlatformPicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlatformPicker(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Checkout directory of the triggering repository.
    pub workdir: PathBuf,
    /// Bind-mount `workdir` into job containers instead of using a named volume.
    pub bind_workdir: bool,
    pub event_name: String,
    pub event_path: Option<PathBuf>,
    pub default_branch: String,
    pub actor: String,
    pub token: String,

    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub vars: HashMap<String, String>,

    /// `runs-on` label (lowercase) to image. `-self-hosted` selects the host environment.
    pub platforms: HashMap<String, String>,
    #[serde(skip)]
    pub platform_picker: Option<PlatformPicker>,

    pub reuse_containers: bool,
    pub force_pull: bool,
    pub privileged: bool,
    pub auto_remove: bool,
    pub userns_mode: String,
    pub container_architecture: String,
    /// Daemon socket to bind into job containers; `-` disables the bind.
    pub container_daemon_socket: String,
    pub container_options: String,
    pub container_cap_add: Vec<String>,
    pub container_cap_drop: Vec<String>,
    pub container_network_mode: String,
    pub need_create_network: bool,
    pub container_max_lifetime_secs: u64,
    pub container_name_prefix: String,
    pub log_output: bool,
    pub use_gitignore: bool,
    pub no_skip_checkout: bool,

    /// Host of the instance that triggered the run (github.com or a Gitea host).
    pub github_instance: String,
    /// Hosts tried, in order, when resolving remote actions.
    pub default_actions_urls: Vec<String>,
    /// `org/repo` actions always fetched from github.com.
    pub replace_ghe_action_with_github_com: Vec<String>,
    pub replace_ghe_action_token_with_github_com: String,

    pub artifact_server_path: String,
    pub artifact_server_addr: String,
    pub artifact_server_port: String,

    /// Overrides the derived cache root when set.
    pub action_cache_dir: Option<PathBuf>,
    pub fetch_lock: FetchLockMode,

    /// Replaces trigger-context derivation entirely when set.
    pub preset_github_context: Option<GitHubContext>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            bind_workdir: false,
            event_name: "push".to_string(),
            event_path: None,
            default_branch: "main".to_string(),
            actor: String::new(),
            token: String::new(),
            env: HashMap::new(),
            secrets: HashMap::new(),
            vars: HashMap::new(),
            platforms: HashMap::new(),
            platform_picker: None,
            reuse_containers: false,
            force_pull: false,
            privileged: false,
            auto_remove: false,
            userns_mode: String::new(),
            container_architecture: String::new(),
            container_daemon_socket: String::new(),
            container_options: String::new(),
            container_cap_add: Vec::new(),
            container_cap_drop: Vec::new(),
            container_network_mode: "host".to_string(),
            need_create_network: false,
            container_max_lifetime_secs: DEFAULT_CONTAINER_MAX_LIFETIME_SECS,
            container_name_prefix: "act".to_string(),
            log_output: false,
            use_gitignore: true,
            no_skip_checkout: false,
            github_instance: "github.com".to_string(),
            default_actions_urls: vec!["https://github.com".to_string()],
            replace_ghe_action_with_github_com: Vec::new(),
            replace_ghe_action_token_with_github_com: String::new(),
            artifact_server_path: String::new(),
            artifact_server_addr: String::new(),
            artifact_server_port: "34567".to_string(),
            action_cache_dir: None,
            fetch_lock: FetchLockMode::default(),
            preset_github_context: None,
        }
    }
}

impl Config {
    /// Load a YAML config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config.normalized())
    }

    /// Lowercase platform labels so lookups are case-insensitive.
    pub fn normalized(mut self) -> Config {
        self.platforms = self
            .platforms
            .into_iter()
            .map(|(label, image)| (label.to_lowercase(), image))
            .collect();
        self
    }

    /// Image configured for a `runs-on` label, matched case-insensitively.
    pub fn platform_for_label(&self, label: &str) -> Option<&str> {
        self.platforms
            .get(&label.to_lowercase())
            .map(String::as_str)
            .filter(|image| !image.is_empty())
    }

    pub fn with_platform_picker<F>(mut self, picker: F) -> Config
    where
        F: Fn(&[String]) -> Option<String> + Send + Sync + 'static,
    {
        self.platform_picker = Some(PlatformPicker(Arc::new(picker)));
        self
    }

    /// Read the trigger payload from `event_path`, or `{}` when none is configured.
    pub fn event_json(&self) -> Result<String> {
        match &self.event_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read event file {}", path.display())),
            None => Ok("{}".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_yaml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "workdir: /src\nplatforms:\n  Ubuntu-Latest: node:20\nfetch_lock: global\nsecrets:\n  TOKEN: abc\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.workdir, PathBuf::from("/src"));
        assert_eq!(config.platform_for_label("ubuntu-latest"), Some("node:20"));
        assert_eq!(config.platform_for_label("UBUNTU-LATEST"), Some("node:20"));
        assert_eq!(config.fetch_lock, FetchLockMode::Global);
        assert_eq!(config.github_instance, "github.com");
        assert_eq!(config.container_max_lifetime_secs, DEFAULT_CONTAINER_MAX_LIFETIME_SECS);
    }

    #[test]
    fn test_platform_picker_is_runtime_only() {
        let config = Config::default().with_platform_picker(|labels| labels.first().cloned());
        let picked = (config.platform_picker.as_ref().unwrap().0)(&["x".to_string()]);
        assert_eq!(picked.as_deref(), Some("x"));
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("platform_picker"));
    }

    #[test]
    fn test_empty_platform_image_is_unresolved() {
        let mut config = Config::default();
        config.platforms.insert("linux".into(), String::new());
        assert_eq!(config.platform_for_label("linux"), None);
    }
}
