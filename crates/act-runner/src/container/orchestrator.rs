// Job container lifecycle: naming, binds and mounts, registry credentials,
// startup of the job and service containers, teardown, and the extra PATH.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::constants::{container as paths, state_files, variables, Architecture};
use act_common::parse_path_file;

use crate::commands::line_handler;
use crate::error::RunnerError;
use crate::pipeline::{guard, parallel, sequence, Operation};
use crate::run_context::RunContext;

use super::environment::{ContainerInput, ExecutionEnvironment, FileEntry};
use super::host_environment::HostEnvironment;

/// Join name parts with `_`, keeping only `[a-zA-Z0-9-]` in each part.
pub fn create_simple_container_name(parts: &[&str]) -> String {
    parts
        .iter()
        .filter_map(|part| {
            let mut cleaned: String = part
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect();
            while cleaned.contains("--") {
                cleaned = cleaned.replace("--", "-");
            }
            let cleaned = cleaned.trim_matches('-');
            (!cleaned.is_empty()).then(|| cleaned.to_string())
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Host path of the daemon socket to bind into the job container.
pub fn docker_daemon_socket_mount_path(daemon_path: &str) -> String {
    if let Some((scheme, rest)) = daemon_path.split_once("://") {
        if scheme.eq_ignore_ascii_case("unix") {
            return rest.to_string();
        }
        if scheme.eq_ignore_ascii_case("npipe") || scheme.chars().all(|c| c.is_ascii_alphabetic()) {
            return paths::DOCKER_SOCKET_PATH.to_string();
        }
    }
    daemon_path.to_string()
}

/// Linux container path of a host path.
fn container_path(host_path: &Path) -> String {
    host_path.to_string_lossy().replace('\\', "/")
}

fn selinux_enforced() -> bool {
    Path::new("/sys/fs/selinux/enforce").exists()
}

impl RunContext {
    /// `<prefix>_WORKFLOW-<workflow>_JOB-<job>`; reusable-workflow children
    /// include the caller job so sibling callers do not collide.
    pub fn job_container_name(&self) -> String {
        let job = match self.stack.caller_job() {
            Some(caller) => format!("JOB-{}-{}", caller, self.name),
            None => format!("JOB-{}", self.name),
        };
        create_simple_container_name(&[
            &self.config.container_name_prefix,
            &format!("WORKFLOW-{}", self.run.workflow.name),
            &job,
        ])
    }

    pub fn network_name(&self) -> String {
        if self.config.need_create_network {
            format!("{}-network", self.job_container_name())
        } else {
            self.config.container_network_mode.clone()
        }
    }

    /// Binds and named-volume mounts of the job container.
    pub fn binds_and_mounts(&self) -> (Vec<String>, BTreeMap<String, String>) {
        let name = self.job_container_name();
        let socket = match self.config.container_daemon_socket.as_str() {
            "" => paths::DOCKER_SOCKET_PATH,
            socket => socket,
        };

        let mut binds = Vec::new();
        if socket != paths::NO_DOCKER_SOCKET {
            binds.push(format!(
                "{}:{}",
                docker_daemon_socket_mount_path(socket),
                paths::DOCKER_SOCKET_PATH
            ));
        }

        let mut mounts = BTreeMap::from([
            (paths::TOOLCACHE_VOLUME.to_string(), paths::TOOLCACHE_PATH.to_string()),
            (format!("{name}-env"), paths::ACT_PATH.to_string()),
        ]);

        if let Some(container) = &self.run.job().container {
            for volume in &container.volumes {
                match volume.split_once(':') {
                    Some((source, target)) if !Path::new(volume).is_absolute() => {
                        mounts.insert(source.to_string(), target.to_string());
                    }
                    _ => binds.push(volume.clone()),
                }
            }
        }

        let workdir = container_path(&self.config.workdir);
        if self.config.bind_workdir {
            let modifiers = if selinux_enforced() {
                ":z"
            } else if cfg!(target_os = "macos") {
                ":delegated"
            } else {
                ""
            };
            binds.push(format!("{}:{}{}", self.config.workdir.display(), workdir, modifiers));
        } else {
            mounts.insert(name, workdir);
        }
        (binds, mounts)
    }

    /// Registry credentials of the job container. Starts from the
    /// `DOCKER_USERNAME`/`DOCKER_PASSWORD` secrets.
    pub fn handle_credentials(&self) -> Result<(String, String)> {
        let secret = |key: &str| self.config.secrets.get(key).cloned().unwrap_or_default();
        let defaults = (
            secret(variables::DOCKER_USERNAME_SECRET),
            secret(variables::DOCKER_PASSWORD_SECRET),
        );
        let Some(credentials) = self.run.job().container.as_ref().and_then(|c| c.credentials.as_ref()) else {
            return Ok(defaults);
        };

        let (username, password) = self.interpolate_credentials(credentials, "container.credentials")?;
        let declared = |key: &str| credentials.get(key).is_some_and(|v| !v.is_empty());
        if !declared("username") || !declared("password") {
            return Err(RunnerError::Credential("container.credentials cannot be empty".into()).into());
        }
        Ok((username, password))
    }

    /// Registry credentials of a service container; empty when none are declared.
    pub fn handle_service_credentials(&self, credentials: Option<&HashMap<String, String>>) -> Result<(String, String)> {
        match credentials {
            None => Ok(Default::default()),
            Some(credentials) => self.interpolate_credentials(credentials, "credentials"),
        }
    }

    fn interpolate_credentials(&self, credentials: &HashMap<String, String>, key: &str) -> Result<(String, String)> {
        if credentials.len() != 2 {
            return Err(RunnerError::Credential("invalid property count for key 'credentials:'".into()).into());
        }
        let field = |name: &str| -> Result<String> {
            let value = self.interpolate(credentials.get(name).map(String::as_str).unwrap_or_default());
            if value.is_empty() {
                return Err(RunnerError::Credential(format!("failed to interpolate {key}.{name}")).into());
            }
            Ok(value)
        };
        Ok((field("username")?, field("password")?))
    }

    /// Start the job environment: the host for self-hosted platforms, a container otherwise.
    pub fn start_container(self: &Arc<Self>) -> Operation {
        let rc = self.clone();
        Operation::new(move |cancel| {
            let rc = rc.clone();
            async move {
                if rc.is_host_env() {
                    rc.start_host_environment(cancel).await
                } else {
                    rc.start_job_container().run(cancel).await
                }
            }
        })
    }

    async fn start_host_environment(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let host = HostEnvironment::create(
            &self.job_container_name(),
            self.services.cache.root(),
            &self.config.workdir,
        )?
        .with_output(line_handler(self));

        for (key, value) in host.runner_context() {
            self.set_env(&format!("RUNNER_{}", key.to_uppercase()), &value);
        }
        self.add_env_fallback(std::env::vars());

        let host: Arc<dyn ExecutionEnvironment> = Arc::new(host);
        self.container.lock().job = Some(host.clone());
        self.copy_state_files(host, cancel).await
    }

    fn copy_state_files(
        &self,
        env: Arc<dyn ExecutionEnvironment>,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let files = vec![
            FileEntry::new(state_files::EVENT_JSON, 0o644, self.event_json.clone()),
            FileEntry::new(state_files::ENV, 0o666, ""),
        ];
        async move {
            let dest = format!("{}/", env.act_path());
            env.copy(&dest, files, cancel).await
        }
    }

    /// Build the job and service containers and the operation that brings them up.
    ///
    /// Credentials are resolved before any container exists, so a credential
    /// error never leaves anything behind.
    fn start_job_container(self: &Arc<Self>) -> Operation {
        let rc = self.clone();
        Operation::new(move |cancel| {
            let rc = rc.clone();
            async move {
                let image = rc.platform_image();
                let (username, password) = rc
                    .handle_credentials()
                    .context("failed to handle credentials")?;

                let job = rc.run.job();
                let mut service_inputs = Vec::with_capacity(job.services.len());
                for (service_id, spec) in &job.services {
                    let (username, password) = rc
                        .handle_service_credentials(spec.credentials.as_ref())
                        .with_context(|| format!("failed to handle service {service_id} credentials"))?;
                    service_inputs.push((service_id.clone(), spec.clone(), username, password));
                }

                tracing::info!(target: "job", "🚀  Start image={}", image);
                let name = rc.job_container_name();
                let network = rc.network_name();
                let (binds, mounts) = rc.binds_and_mounts();
                let workdir = container_path(&rc.config.workdir);
                let output = line_handler(&rc);
                let driver = rc.services.driver.clone();

                let mut services = Vec::with_capacity(service_inputs.len());
                for (service_id, spec, username, password) in service_inputs {
                    let ctx = rc.expression_context();
                    let env = spec
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), rc.evaluator().interpolate(&ctx, v)))
                        .collect();
                    let cmd = spec.cmd.iter().map(|c| rc.evaluator().interpolate(&ctx, c)).collect();
                    let input = ContainerInput {
                        name: create_simple_container_name(&[&name, &service_id]),
                        image: spec.image.clone(),
                        username,
                        password,
                        cmd,
                        env,
                        working_dir: workdir.clone(),
                        binds: binds.clone(),
                        mounts: BTreeMap::from([
                            (service_id.clone(), workdir.clone()),
                            (paths::TOOLCACHE_VOLUME.to_string(), paths::TOOLCACHE_PATH.to_string()),
                            (paths::ACTIONS_VOLUME.to_string(), paths::ACTIONS_PATH.to_string()),
                        ]),
                        ports: spec.ports.clone(),
                        network_mode: network.clone(),
                        network_aliases: vec![service_id.clone()],
                        privileged: rc.config.privileged,
                        userns_mode: rc.config.userns_mode.clone(),
                        platform: rc.config.container_architecture.clone(),
                        options: spec.options.clone(),
                        auto_remove: rc.config.auto_remove,
                        output: Some(output.clone()),
                        ..ContainerInput::default()
                    };
                    let service = driver
                        .new_container(input)
                        .ok_or_else(|| RunnerError::ContainerCreate(format!("service {service_id}")))?;
                    services.push(service);
                }

                let arch = Architecture::from_platform(&rc.config.container_architecture);
                let container_spec = job.container.clone().unwrap_or_default();
                let options = match &job.container {
                    Some(c) => c.options.clone(),
                    None => rc.config.container_options.clone(),
                };
                let job_input = ContainerInput {
                    name: name.clone(),
                    image,
                    username,
                    password,
                    entrypoint: vec![
                        "/bin/sleep".to_string(),
                        rc.config.container_max_lifetime_secs.to_string(),
                    ],
                    env: BTreeMap::from([
                        ("RUNNER_TOOL_CACHE".to_string(), paths::HOSTED_TOOL_CACHE.to_string()),
                        ("RUNNER_OS".to_string(), "Linux".to_string()),
                        ("RUNNER_ARCH".to_string(), arch.to_string()),
                        ("RUNNER_TEMP".to_string(), paths::RUNNER_TEMP.to_string()),
                        ("LANG".to_string(), "C.UTF-8".to_string()),
                    ]),
                    working_dir: workdir,
                    binds,
                    mounts,
                    ports: container_spec.ports,
                    network_mode: network.clone(),
                    network_aliases: vec![rc.name.clone()],
                    privileged: rc.config.privileged,
                    userns_mode: rc.config.userns_mode.clone(),
                    platform: rc.config.container_architecture.clone(),
                    options,
                    auto_remove: rc.config.auto_remove,
                    output: Some(output),
                    ..ContainerInput::default()
                };
                let job_container = driver
                    .new_container(job_input)
                    .ok_or_else(|| RunnerError::ContainerCreate("job".into()))?;

                {
                    let mut state = rc.container.lock();
                    state.job = Some(job_container.clone());
                    state.services = services.clone();
                    if rc.config.need_create_network {
                        state.created_network = Some(network.clone());
                    }
                }

                let force_pull = rc.config.force_pull;
                let cap_add = Arc::new(rc.config.container_cap_add.clone());
                let cap_drop = Arc::new(rc.config.container_cap_drop.clone());

                let pull_services = parallel(
                    services.len(),
                    services.iter().map(|s| pull_op(s.clone(), force_pull)).collect(),
                );
                let create_network = {
                    let driver = driver.clone();
                    let network = network.clone();
                    Operation::new(move |cancel| {
                        let driver = driver.clone();
                        let network = network.clone();
                        async move { driver.create_network(&network, cancel).await }
                    })
                };
                let start_services = parallel(
                    services.len(),
                    services
                        .iter()
                        .map(|s| {
                            sequence([
                                Some(pull_op(s.clone(), false)),
                                Some(create_op(s.clone(), cap_add.clone(), cap_drop.clone())),
                                Some(start_op(s.clone())),
                            ])
                        })
                        .collect(),
                );
                let copy_files = {
                    let rc = rc.clone();
                    let job_container = job_container.clone();
                    Operation::new(move |cancel| rc.copy_state_files(job_container.clone(), cancel))
                };

                sequence([
                    Some(pull_services),
                    Some(pull_op(job_container.clone(), force_pull)),
                    Some(guard(create_network, rc.config.need_create_network)),
                    Some(start_services),
                    Some(create_op(job_container.clone(), cap_add, cap_drop)),
                    Some(start_op(job_container)),
                    Some(copy_files),
                ])
                .run(cancel)
                .await
            }
        })
    }

    /// Tear down the job environment. Every failure is logged and swallowed.
    ///
    /// Runs on its own cancellation handle so cleanup still happens after
    /// the job was cancelled.
    pub fn stop_container(self: &Arc<Self>) -> Operation {
        let rc = self.clone();
        Operation::new(move |_| {
            let rc = rc.clone();
            async move {
                let cancel = CancellationToken::new();
                let (job, services, network) = {
                    let state = rc.container.lock();
                    (state.job.clone(), state.services.clone(), state.created_network.clone())
                };
                let Some(job) = job else {
                    return Ok(());
                };

                if job.is_host() {
                    log_cleanup(job.remove(cancel).await, "remove host environment");
                    return Ok(());
                }
                if rc.config.reuse_containers {
                    tracing::debug!(target: "container", "Keeping containers of {} for reuse", rc);
                    return Ok(());
                }

                let driver = rc.services.driver.clone();
                let name = rc.job_container_name();
                log_cleanup(job.remove(cancel.clone()).await, "remove job container");
                log_cleanup(driver.remove_volume(&name, false, cancel.clone()).await, "remove workdir volume");
                log_cleanup(
                    driver.remove_volume(&format!("{name}-env"), false, cancel.clone()).await,
                    "remove env volume",
                );
                let removals = services.iter().map(|s| {
                    let cancel = cancel.clone();
                    async move { s.remove(cancel).await }
                });
                for result in futures::future::join_all(removals).await {
                    log_cleanup(result, "remove service container");
                }
                if let Some(network) = network {
                    log_cleanup(driver.remove_network(&network, cancel).await, "remove network");
                }
                Ok(())
            }
        })
    }

    pub fn close_container(self: &Arc<Self>) -> Operation {
        let rc = self.clone();
        Operation::new(move |_| {
            let rc = rc.clone();
            async move {
                match rc.job_container() {
                    Some(job) => job.close().await,
                    None => Ok(()),
                }
            }
        })
    }

    /// Prepend the extra path to `env`'s path variable, seeding it from the
    /// image env or the environment default when unset.
    pub async fn apply_extra_path(&self, env: &mut HashMap<String, String>, cancel: CancellationToken) {
        let extra = self.extra_path();
        if extra.is_empty() {
            return;
        }
        let Some(container) = self.job_container() else {
            return;
        };
        let variable = container.path_variable_name();
        let current = env.get(variable).cloned().filter(|p| !p.is_empty());
        let current = match current {
            Some(path) => path,
            None => {
                let from_image = match container.image_env(cancel).await {
                    Ok(image_env) => image_env.get(variable).cloned().filter(|p| !p.is_empty()),
                    Err(e) => {
                        tracing::debug!(target: "container", "Unable to read image env: {:#}", e);
                        None
                    }
                };
                from_image.unwrap_or_else(|| container.default_path())
            }
        };
        let mut segments = extra;
        segments.push(current);
        env.insert(variable.to_string(), container.join_path_variable(&segments));
    }

    /// Read the path-command file out of the environment and prepend each line.
    pub async fn update_extra_path(&self, path_file: &str, cancel: CancellationToken) -> Result<()> {
        let Some(container) = self.job_container() else {
            return Ok(());
        };
        let Some(content) = container.read_file(path_file, cancel).await? else {
            return Ok(());
        };
        for line in parse_path_file(&content) {
            self.add_path(&line);
        }
        Ok(())
    }
}

fn log_cleanup(result: Result<()>, what: &str) {
    if let Err(e) = result {
        tracing::warn!(target: "container", "Failed to {}: {:#}", what, e);
    }
}

fn pull_op(env: Arc<dyn ExecutionEnvironment>, force: bool) -> Operation {
    Operation::new(move |cancel| {
        let env = env.clone();
        async move { env.pull(force, cancel).await }
    })
}

fn create_op(env: Arc<dyn ExecutionEnvironment>, cap_add: Arc<Vec<String>>, cap_drop: Arc<Vec<String>>) -> Operation {
    Operation::new(move |cancel| {
        let env = env.clone();
        let cap_add = cap_add.clone();
        let cap_drop = cap_drop.clone();
        async move { env.create(&cap_add, &cap_drop, cancel).await }
    })
}

fn start_op(env: Arc<dyn ExecutionEnvironment>) -> Operation {
    Operation::new(move |cancel| {
        let env = env.clone();
        async move { env.start(false, cancel).await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::test_support::{context_with, RecordingDriver};

    const JOB: &str = "name: ci\njobs:\n  build:\n    runs-on: ubuntu-latest\n    steps: []\n";

    fn platform_config() -> Config {
        let mut config = Config::default();
        config.workdir = "/src/repo".into();
        config.platforms.insert("ubuntu-latest".into(), "node:20".into());
        config
    }

    #[test]
    fn test_create_simple_container_name() {
        assert_eq!(
            create_simple_container_name(&["act", "WORKFLOW-CI / Build", "JOB-test (1)"]),
            "act_WORKFLOW-CI-Build_JOB-test-1"
        );
        assert_eq!(create_simple_container_name(&["a", "--", "b"]), "a_b");
    }

    #[test]
    fn test_daemon_socket_mount_path() {
        assert_eq!(docker_daemon_socket_mount_path("unix:///run/user/1000/docker.sock"), "/run/user/1000/docker.sock");
        assert_eq!(docker_daemon_socket_mount_path("npipe:////./pipe/docker_engine"), "/var/run/docker.sock");
        assert_eq!(docker_daemon_socket_mount_path("tcp://localhost:2375"), "/var/run/docker.sock");
        assert_eq!(docker_daemon_socket_mount_path("/var/run/podman.sock"), "/var/run/podman.sock");
    }

    #[test]
    fn test_binds_and_mounts_are_stable() {
        let (rc, _) = context_with(
            "name: ci\njobs:\n  build:\n    runs-on: ubuntu-latest\n    container:\n      image: node:20\n      volumes:\n        - cache:/cache\n        - /host:/host\n        - anonymous\n    steps: []\n",
            platform_config(),
        );
        let first = rc.binds_and_mounts();
        let second = rc.binds_and_mounts();
        assert_eq!(first, second);

        let (binds, mounts) = first;
        assert_eq!(binds, vec!["/var/run/docker.sock:/var/run/docker.sock", "/host:/host", "anonymous"]);
        let name = rc.job_container_name();
        assert_eq!(mounts.get("cache").map(String::as_str), Some("/cache"));
        assert_eq!(mounts.get("act-toolcache").map(String::as_str), Some("/toolcache"));
        assert_eq!(mounts.get(&format!("{name}-env")).map(String::as_str), Some("/var/run/act"));
        assert_eq!(mounts.get(&name).map(String::as_str), Some("/src/repo"));
    }

    #[test]
    fn test_disabled_socket_has_no_bind() {
        let mut config = platform_config();
        config.container_daemon_socket = "-".into();
        let (rc, _) = context_with(JOB, config);
        let (binds, _) = rc.binds_and_mounts();
        assert!(binds.is_empty());
    }

    #[test]
    fn test_job_container_name_and_network() {
        let mut config = platform_config();
        config.need_create_network = true;
        let (rc, _) = context_with(JOB, config);
        assert_eq!(rc.job_container_name(), "act_WORKFLOW-ci_JOB-build");
        assert_eq!(rc.network_name(), "act_WORKFLOW-ci_JOB-build-network");

        let (rc, _) = context_with(JOB, platform_config());
        assert_eq!(rc.network_name(), "host");
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let (rc, _) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    container:\n      image: private/img\n      credentials:\n        username: me\n    steps: []\n",
            platform_config(),
        );
        let err = rc.handle_credentials().unwrap_err();
        assert!(matches!(crate::error::runner_error(&err), Some(RunnerError::Credential(_))));
    }

    #[test]
    fn test_credentials_from_secrets_and_container() {
        let mut config = platform_config();
        config.secrets.insert("DOCKER_USERNAME".into(), "bot".into());
        config.secrets.insert("DOCKER_PASSWORD".into(), "pw".into());
        config.secrets.insert("REG_PW".into(), "s3cret".into());
        let (rc, _) = context_with(JOB, config.clone());
        assert_eq!(rc.handle_credentials().unwrap(), ("bot".to_string(), "pw".to_string()));

        let (rc, _) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    container:\n      image: private/img\n      credentials:\n        username: me\n        password: ${{ secrets.REG_PW }}\n    steps: []\n",
            config,
        );
        assert_eq!(rc.handle_credentials().unwrap(), ("me".to_string(), "s3cret".to_string()));
    }

    #[tokio::test]
    async fn test_credential_error_before_any_container_work() {
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    container:\n      image: private/img\n      credentials:\n        username: me\n        password: ''\n    steps: []\n",
            platform_config(),
        );
        let err = rc.start_container().run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(crate::error::runner_error(&err), Some(RunnerError::Credential(_))));
        assert!(driver.ops().is_empty());
    }

    #[tokio::test]
    async fn test_service_with_only_username_fails_before_any_container_work() {
        let mut config = platform_config();
        config.need_create_network = true;
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    services:\n      cache:\n        image: private/redis\n        credentials:\n          username: me\n    steps: []\n",
            config,
        );
        let err = rc.start_container().run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(crate::error::runner_error(&err), Some(RunnerError::Credential(_))));
        assert!(driver.ops().is_empty());
    }

    #[tokio::test]
    async fn test_startup_order_with_services_and_network() {
        let mut config = platform_config();
        config.need_create_network = true;
        let (rc, driver) = context_with(
            "name: ci\njobs:\n  build:\n    runs-on: ubuntu-latest\n    services:\n      redis:\n        image: redis:7\n    steps: []\n",
            config,
        );
        rc.start_container().run(CancellationToken::new()).await.unwrap();

        let ops = driver.ops();
        let job = "act_WORKFLOW-ci_JOB-build";
        let service = "act_WORKFLOW-ci_JOB-build_redis";
        let position = |op: &str| ops.iter().position(|o| o == op).unwrap_or_else(|| panic!("missing {op} in {ops:?}"));
        assert!(position(&format!("pull:{service}")) < position(&format!("pull:{job}")));
        assert!(position(&format!("pull:{job}")) < position(&format!("network-create:{job}-network")));
        assert!(position(&format!("network-create:{job}-network")) < position(&format!("create:{service}")));
        assert!(position(&format!("start:{service}")) < position(&format!("create:{job}")));
        assert!(position(&format!("create:{job}")) < position(&format!("start:{job}")));
        assert!(position(&format!("start:{job}")) < position("copy:/var/run/act/"));

        let service_input = driver.input(service).unwrap();
        assert_eq!(service_input.network_aliases, vec!["redis"]);
        assert_eq!(service_input.mounts.get("act-actions").map(String::as_str), Some("/actions"));
        let job_input = driver.input(job).unwrap();
        assert_eq!(job_input.entrypoint[0], "/bin/sleep");
        assert_eq!(job_input.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(
            driver.file("/var/run/act/workflow/event.json").as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn test_teardown_order_and_reuse() {
        let mut config = platform_config();
        config.need_create_network = true;
        let (rc, driver) = context_with(
            "name: ci\njobs:\n  build:\n    runs-on: ubuntu-latest\n    services:\n      db:\n        image: postgres\n    steps: []\n",
            config.clone(),
        );
        rc.start_container().run(CancellationToken::new()).await.unwrap();
        driver.clear_ops();
        rc.stop_container().run(CancellationToken::new()).await.unwrap();
        let job = "act_WORKFLOW-ci_JOB-build";
        assert_eq!(
            driver.ops(),
            vec![
                format!("remove:{job}"),
                format!("volume-rm:{job}"),
                format!("volume-rm:{job}-env"),
                format!("remove:{job}_db"),
                format!("network-rm:{job}-network"),
            ]
        );

        config.reuse_containers = true;
        let (rc, driver) = context_with(JOB, config);
        rc.start_container().run(CancellationToken::new()).await.unwrap();
        driver.clear_ops();
        rc.stop_container().run(CancellationToken::new()).await.unwrap();
        assert!(driver.ops().is_empty());
    }

    #[tokio::test]
    async fn test_extra_path_seeded_from_default() {
        let (rc, _) = context_with(JOB, platform_config());
        rc.start_container().run(CancellationToken::new()).await.unwrap();
        rc.add_path("/opt/a");
        rc.add_path("/opt/b");
        let mut env = HashMap::new();
        rc.apply_extra_path(&mut env, CancellationToken::new()).await;
        assert_eq!(env["PATH"], format!("/opt/b:/opt/a:{}", paths::DEFAULT_PATH));
    }

    #[tokio::test]
    async fn test_update_extra_path_from_file() {
        let (rc, driver) = context_with(JOB, platform_config());
        rc.start_container().run(CancellationToken::new()).await.unwrap();
        driver.write_file("/var/run/act/workflow/pathcmd.txt", "/one\n\n/two\n");
        rc.update_extra_path("/var/run/act/workflow/pathcmd.txt", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rc.extra_path(), vec!["/two".to_string(), "/one".to_string()]);
    }

    #[tokio::test]
    async fn test_self_hosted_uses_host_environment() {
        let cache = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workdir = workdir.path().to_path_buf();
        config.action_cache_dir = Some(cache.path().to_path_buf());
        config.platforms.insert("self".into(), "-Self-Hosted".into());
        let (rc, driver) = context_with("jobs:\n  build:\n    runs-on: self\n    steps: []\n", config);
        rc.start_container().run(CancellationToken::new()).await.unwrap();

        let host = rc.job_container().unwrap();
        assert!(host.is_host());
        assert!(Path::new(&host.act_path()).join("workflow/event.json").exists());
        assert!(rc.env().contains_key("RUNNER_TEMP"));
        assert!(driver.ops().is_empty());

        rc.stop_container().run(CancellationToken::new()).await.unwrap();
        assert!(!Path::new(&host.act_path()).exists());
    }
}
