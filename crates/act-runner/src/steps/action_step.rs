// `uses:` steps backed by an action manifest, either fetched into the source
// cache (`org/repo[/path]@ref`) or read from the workspace (`./path`).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use act_common::process_invoker::split_args;

use crate::action_manifest::{ActionKind, ActionManifest};
use crate::commands::line_handler;
use crate::container::ExecRequest;
use crate::expressions::ExpressionContext;
use crate::github_context::GitHubContext;
use crate::model::Step;
use crate::reference::{is_local_checkout, safe_filename, RemoteAction};
use crate::run_context::RunContext;

use super::composite::CompositeRun;
use super::docker_step::run_step_container;
use super::{Stage, StepHandler};

/// A resolved action, ready to run.
struct Action {
    manifest: ActionManifest,
    kind: ActionKind,
    /// Directory of the action inside the job environment.
    env_dir: String,
    remote: Option<RemoteAction>,
    composite: Option<CompositeRun>,
}

enum Resolution {
    /// `actions/checkout` of the triggering repository: copy the workspace
    /// instead of fetching anything.
    LocalCheckout,
    Action(Box<Action>),
}

pub struct ActionStep {
    rc: Arc<RunContext>,
    step: Step,
    remote: bool,
    resolution: OnceCell<Resolution>,
}

impl ActionStep {
    pub fn remote(rc: Arc<RunContext>, step: Step) -> Self {
        Self {
            rc,
            step,
            remote: true,
            resolution: OnceCell::new(),
        }
    }

    pub fn local(rc: Arc<RunContext>, step: Step) -> Self {
        Self {
            rc,
            step,
            remote: false,
            resolution: OnceCell::new(),
        }
    }

    fn uses(&self) -> &str {
        self.step.uses.as_deref().unwrap_or_default()
    }

    fn with(&self) -> HashMap<String, String> {
        let ctx = self.rc.expression_context();
        self.rc.evaluator().interpolate_map(&ctx, &self.step.with)
    }

    fn action(&self) -> Option<&Action> {
        match self.resolution.get()? {
            Resolution::Action(action) => Some(action),
            Resolution::LocalCheckout => None,
        }
    }

    async fn resolve(&self, cancel: CancellationToken) -> Result<Resolution> {
        let uses = self.uses();
        let config = &self.rc.config;

        let (host_dir, cache_dir, remote) = if self.remote {
            let mut action = RemoteAction::parse(uses)?;

            let ghc = self.rc.github_context();
            if !config.no_skip_checkout && is_local_checkout(&action, &self.with(), &ghc.repository, &ghc.git_ref) {
                tracing::debug!(target: "step", "Skipping local actions/checkout because workdir was already copied");
                return Ok(Resolution::LocalCheckout);
            }

            if config
                .replace_ghe_action_with_github_com
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&action.repository()))
            {
                action.url = Some("https://github.com".to_string());
            }

            let url = action
                .available_clone_url(&config.default_actions_urls, &self.rc.services.http)
                .await
                .with_context(|| format!("failed to get available clone url of [{uses}] action"))?;
            // Actions are fetched anonymously: the job token belongs to the
            // triggering instance, which need not be the one serving the action.
            let cache_dir = self
                .rc
                .services
                .cache
                .ensure(uses, &url, &action.reference, "", cancel.clone())
                .await?;
            let host_dir = if action.path.is_empty() {
                cache_dir.clone()
            } else {
                cache_dir.join(&action.path)
            };
            (host_dir, Some(cache_dir), Some(action))
        } else {
            let relative = uses.trim_start_matches("./");
            (config.workdir.join(relative), None, None)
        };

        let manifest = ActionManifest::load(&host_dir)?;
        let kind = manifest.runs.kind()?;
        let env_dir = self.stage_action_dir(&host_dir, cache_dir, remote.as_ref(), cancel).await?;

        let composite = match kind {
            ActionKind::Composite => Some(CompositeRun::new(
                &self.rc,
                &self.step.id,
                uses,
                &env_dir,
                &manifest,
                self.inputs(&manifest),
            )?),
            _ => None,
        };

        Ok(Resolution::Action(Box::new(Action {
            manifest,
            kind,
            env_dir,
            remote,
            composite,
        })))
    }

    /// Make the action directory visible to the job environment. Fetched
    /// actions are copied under `<act>/actions/`; local ones already live in
    /// the workspace.
    async fn stage_action_dir(
        &self,
        host_dir: &Path,
        cache_dir: Option<PathBuf>,
        remote: Option<&RemoteAction>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let container = self
            .rc
            .job_container()
            .ok_or_else(|| anyhow!("job environment is not running"))?;
        let (Some(cache_dir), Some(remote)) = (cache_dir, remote) else {
            return Ok(container.to_container_path(host_dir));
        };
        if container.is_host() {
            return Ok(container.to_container_path(host_dir));
        }

        let dest = format!("{}/actions/{}", container.act_path(), safe_filename(self.uses()));
        container.copy_dir(&format!("{dest}/"), &cache_dir, false, cancel).await?;
        Ok(if remote.path.is_empty() {
            dest
        } else {
            format!("{dest}/{}", remote.path)
        })
    }

    /// Action inputs: the step's `with` values over the manifest defaults.
    fn inputs(&self, manifest: &ActionManifest) -> Map<String, Value> {
        let ctx = self.rc.expression_context();
        let mut inputs = self.rc.evaluator().interpolate_map(&ctx, &manifest.input_defaults());
        inputs.extend(self.with());
        inputs
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect()
    }

    /// `INPUT_<NAME>` variables for the action process.
    fn input_env(&self, manifest: &ActionManifest) -> HashMap<String, String> {
        self.inputs(manifest)
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (format!("INPUT_{}", name.to_uppercase().replace(' ', "_")), value)
            })
            .collect()
    }

    /// Expression context with `inputs` bound to the action's inputs.
    fn action_context(&self, manifest: &ActionManifest) -> ExpressionContext {
        self.rc
            .expression_context()
            .with("inputs", Value::Object(self.inputs(manifest)))
    }

    async fn copy_workspace(&self, cancel: CancellationToken) -> Result<()> {
        let config = &self.rc.config;
        if config.bind_workdir {
            tracing::debug!(target: "step", "Skipping local actions/checkout because you bound your workspace");
            return Ok(());
        }
        let container = self
            .rc
            .job_container()
            .ok_or_else(|| anyhow!("job environment is not running"))?;
        let path = self.with().get("path").cloned().unwrap_or_default();
        let dest = format!("{}/{}", self.rc.container_workdir().trim_end_matches('/'), path);
        container
            .copy_dir(&dest, &config.workdir, config.use_gitignore, cancel)
            .await
    }

    async fn run_node(&self, action: &Action, stage: Stage, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()> {
        let runs = &action.manifest.runs;
        let entry = match stage {
            Stage::Pre => runs.pre.as_deref(),
            Stage::Main => runs.main.as_deref(),
            Stage::Post => runs.post.as_deref(),
        }
        .ok_or_else(|| anyhow!("action '{}' has no {} entry point", self.uses(), stage))?;

        let container = self
            .rc
            .job_container()
            .ok_or_else(|| anyhow!("job environment is not running"))?;
        let command = vec!["node".to_string(), format!("{}/{}", action.env_dir, entry)];
        tracing::debug!(target: "step", "executing remote job container: {:?}", command);
        container
            .exec(
                ExecRequest {
                    command,
                    env,
                    user: String::new(),
                    workdir: self.rc.container_workdir(),
                    on_line: Some(line_handler(&self.rc)),
                },
                cancel,
            )
            .await
    }

    async fn run_docker(&self, action: &Action, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()> {
        let runs = &action.manifest.runs;
        let image = runs.image.as_deref().unwrap_or_default();
        let Some(image) = image.strip_prefix("docker://") else {
            bail!(
                "action '{}' builds its image from '{}'; only prebuilt `docker://` images are supported",
                self.uses(),
                image
            );
        };

        let ctx = self.action_context(&action.manifest);
        let evaluator = self.rc.evaluator();
        let with = self.with();
        let entrypoint = match with.get("entrypoint") {
            Some(e) => split_args(e),
            None => runs
                .entrypoint
                .as_deref()
                .map(|e| split_args(&evaluator.interpolate(&ctx, e)))
                .unwrap_or_default(),
        };
        let cmd = match with.get("args") {
            Some(args) => split_args(args),
            None => runs.args.iter().map(|a| evaluator.interpolate(&ctx, a)).collect(),
        };
        run_step_container(&self.rc, &self.step.id, image.to_string(), entrypoint, cmd, env, cancel).await
    }
}

#[async_trait]
impl StepHandler for ActionStep {
    fn step(&self) -> &Step {
        &self.step
    }

    async fn prepare(&self, cancel: CancellationToken) -> Result<()> {
        self.resolution.get_or_try_init(|| self.resolve(cancel)).await?;
        Ok(())
    }

    fn has_stage(&self, stage: Stage) -> bool {
        let Some(action) = self.action() else {
            return stage == Stage::Main;
        };
        match (stage, action.kind) {
            (Stage::Main, _) => true,
            (Stage::Pre, ActionKind::Node) => action.manifest.runs.has_pre(),
            (Stage::Post, ActionKind::Node) => action.manifest.runs.has_post(),
            (Stage::Pre | Stage::Post, ActionKind::Composite) => true,
            (_, ActionKind::Docker) => false,
        }
    }

    fn condition(&self, stage: Stage) -> String {
        match (stage, self.action()) {
            (Stage::Pre, Some(action)) if action.kind == ActionKind::Node => action.manifest.runs.pre_if().to_string(),
            (Stage::Post, Some(action)) if action.kind == ActionKind::Node => action.manifest.runs.post_if().to_string(),
            (Stage::Main, _) => self.step.condition().to_string(),
            _ => "always()".to_string(),
        }
    }

    fn stage_env(&self, _stage: Stage) -> HashMap<String, String> {
        let Some(action) = self.action() else {
            return HashMap::new();
        };
        let ctx = self.action_context(&action.manifest);
        let mut env = self.rc.evaluator().interpolate_map(&ctx, &action.manifest.runs.env);
        env.extend(self.input_env(&action.manifest));
        for (name, value) in self.rc.action_state(&self.step.id) {
            env.insert(format!("STATE_{name}"), value);
        }
        env
    }

    fn file_commands(&self) -> bool {
        !self.action().is_some_and(|a| a.kind == ActionKind::Composite)
    }

    fn github_overrides(&self, ghc: &mut GitHubContext) {
        let Some(action) = self.action() else {
            return;
        };
        ghc.action_path = action.env_dir.clone();
        if let Some(remote) = &action.remote {
            ghc.action_repository = remote.repository();
            ghc.action_ref = remote.reference.clone();
        }
    }

    async fn execute(&self, stage: Stage, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()> {
        let action = match self.resolution.get() {
            Some(Resolution::LocalCheckout) => return self.copy_workspace(cancel).await,
            Some(Resolution::Action(action)) => action,
            None => bail!("action '{}' was not prepared", self.uses()),
        };
        match (action.kind, &action.composite) {
            (ActionKind::Node, _) => self.run_node(action, stage, env, cancel).await,
            (ActionKind::Docker, _) => self.run_docker(action, env, cancel).await,
            (ActionKind::Composite, Some(composite)) => {
                let ctx = self.rc.expression_context();
                let mut layer = self.rc.evaluator().interpolate_map(&ctx, &self.step.env);
                layer.extend(self.input_env(&action.manifest));
                let inputs = self.inputs(&action.manifest);
                composite.run_stage(stage, layer, inputs, cancel).await
            }
            (ActionKind::Composite, None) => bail!("composite action '{}' has no run context", self.uses()),
        }
    }
}
