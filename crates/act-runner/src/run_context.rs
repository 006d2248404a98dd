// Per-job execution state and the job entry point.
//
// A `RunContext` is created once per job, and once per composite action or
// reusable-workflow invocation beneath it. Its mutable state is split into
// environment, output and container records, each behind its own lock; locks
// are never held across an await point.

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use act_common::constants::{container as paths, state_files, variables, COMPOSITE_ACTIONS_MAX_DEPTH};
use act_common::{SecretMasker, StepStatus};

use crate::config::Config;
use crate::container::{ContainerDriver, ExecutionEnvironment};
use crate::expressions::{DefaultStatusCheck, ExpressionContext, ExpressionEvaluator};
use crate::github_context::{with_github_env, ContextInputs, GitHubContext};
use crate::job_executor::job_executor;
use crate::model::{Job, JobKind, Run, Step, Workflow};
use crate::pipeline::Operation;
use crate::planner::WorkflowPlanner;
use crate::runner::reusable_workflow_executor;
use crate::source_cache::SourceCache;
use crate::step_results::StepResults;

/// Collaborators shared by every run context of a process.
pub struct RunnerServices {
    pub driver: Arc<dyn ContainerDriver>,
    pub cache: Arc<SourceCache>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub planner: Arc<dyn WorkflowPlanner>,
    pub http: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Call stack
// ---------------------------------------------------------------------------

/// One level of nesting between the top-level job and a run context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Job { job_id: String },
    Composite { step_id: String, action: String },
    ReusableWorkflow { caller_job: String, uses: String },
}

/// The chain of frames that led to a run context, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn root(job_id: &str) -> Self {
        Self {
            frames: vec![Frame::Job {
                job_id: job_id.to_string(),
            }],
        }
    }

    /// A new stack with `frame` on top. Fails when composite actions nest too deep.
    pub fn push(&self, frame: Frame) -> Result<CallStack> {
        let mut frames = self.frames.clone();
        frames.push(frame);
        let stack = CallStack { frames };
        if stack.composite_depth() > COMPOSITE_ACTIONS_MAX_DEPTH {
            anyhow::bail!(
                "composite action nesting exceeds the maximum depth of {} ({})",
                COMPOSITE_ACTIONS_MAX_DEPTH,
                stack
            );
        }
        Ok(stack)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn composite_depth(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| matches!(f, Frame::Composite { .. }))
            .count()
    }

    /// Job id of the innermost reusable-workflow caller.
    pub fn caller_job(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::ReusableWorkflow { caller_job, .. } => Some(caller_job.as_str()),
            _ => None,
        })
    }
}

impl std::fmt::Display for CallStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Job { job_id } => job_id.clone(),
                Frame::Composite { step_id, action } => format!("{step_id}({action})"),
                Frame::ReusableWorkflow { uses, .. } => uses.clone(),
            })
            .collect();
        f.write_str(&parts.join(" > "))
    }
}

// ---------------------------------------------------------------------------
// State records
// ---------------------------------------------------------------------------

/// Environment written at runtime (`GITHUB_ENV`, `GITHUB_PATH`), shared by a
/// job and every composite run beneath it.
#[derive(Debug, Default)]
pub struct SharedEnv {
    pub global: HashMap<String, String>,
    pub extra_path: Vec<String>,
}

#[derive(Debug, Default)]
struct EnvironmentState {
    /// Layered env, computed on first use and after each refresh.
    merged: RwLock<Option<HashMap<String, String>>>,
    /// Extra layer of a composite run (its step env and `INPUT_*` values).
    layer: RwLock<HashMap<String, String>>,
    shared: Arc<Mutex<SharedEnv>>,
}

/// Maps an inner step output onto an output of the enclosing step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappableOutput {
    pub step_id: String,
    pub output_name: String,
}

#[derive(Debug, Default)]
struct OutputState {
    step_results: StepResults,
    /// Action identity (step id) → key → value, from `save-state` and `GITHUB_STATE`.
    intra_action_state: HashMap<String, HashMap<String, String>>,
    output_mappings: HashMap<MappableOutput, MappableOutput>,
    current_step: String,
    job_outputs: HashMap<String, String>,
}

#[derive(Default)]
pub(crate) struct ContainerState {
    pub job: Option<Arc<dyn ExecutionEnvironment>>,
    pub services: Vec<Arc<dyn ExecutionEnvironment>>,
    /// Network created for this job, removed on teardown.
    pub created_network: Option<String>,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Everything needed to construct a top-level run context.
pub struct NewRunContext {
    pub config: Arc<Config>,
    pub run: Run,
    pub services: Arc<RunnerServices>,
    pub event_json: String,
    pub matrix: Map<String, Value>,
    pub inputs: Map<String, Value>,
    pub needs: Map<String, Value>,
    pub stack: CallStack,
    /// Masker of the caller, for reusable-workflow children.
    pub masks: Option<SecretMasker>,
}

pub struct RunContext {
    pub config: Arc<Config>,
    pub run: Run,
    pub services: Arc<RunnerServices>,
    pub event_json: String,
    pub matrix: Map<String, Value>,
    pub masks: SecretMasker,
    pub stack: CallStack,
    /// Interpolated job name.
    pub name: String,
    /// `github.action_path` of a composite run.
    pub action_path: String,
    /// `inputs` context; a composite run replaces it on every stage.
    inputs: RwLock<Map<String, Value>>,
    needs: Map<String, Value>,
    /// Enclosing run context of a composite run.
    parent: Option<Arc<RunContext>>,
    env: EnvironmentState,
    outputs: Mutex<OutputState>,
    pub(crate) container: Mutex<ContainerState>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("name", &self.to_string())
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

/// `<workflow>/<job>`, prefixed with the caller job id for reusable workflows.
impl std::fmt::Display for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stack.caller_job() {
            Some(caller) => write!(f, "{}/{}/{}", caller, self.run.workflow.name, self.name),
            None => write!(f, "{}/{}", self.run.workflow.name, self.name),
        }
    }
}

impl RunContext {
    pub fn new(input: NewRunContext) -> Arc<RunContext> {
        let masks = input.masks.unwrap_or_default();
        masks.add_all(input.config.secrets.values());

        let mut rc = RunContext {
            config: input.config,
            run: input.run,
            services: input.services,
            event_json: input.event_json,
            matrix: input.matrix,
            masks,
            stack: input.stack,
            name: String::new(),
            action_path: String::new(),
            inputs: RwLock::new(input.inputs),
            needs: input.needs,
            parent: None,
            env: EnvironmentState::default(),
            outputs: Mutex::new(OutputState::default()),
            container: Mutex::new(ContainerState::default()),
        };
        let name = rc.interpolate(&rc.run.job_name());
        rc.name = name;
        Arc::new(rc)
    }

    /// A run context for the steps of a composite action invoked by `step_id`.
    ///
    /// The child shares the parent's runtime env, extra path, masks and
    /// containers; step results and outputs are its own.
    pub fn composite_child(
        parent: &Arc<RunContext>,
        step_id: &str,
        action: &str,
        action_path: &str,
        steps: Vec<Step>,
        inputs: Map<String, Value>,
    ) -> Result<Arc<RunContext>> {
        let stack = parent.stack.push(Frame::Composite {
            step_id: step_id.to_string(),
            action: action.to_string(),
        })?;
        let job_id = parent.run.job_id.clone();
        let workflow = Workflow {
            name: parent.run.workflow.name.clone(),
            jobs: [(
                job_id.clone(),
                Job {
                    name: Some(parent.name.clone()),
                    steps,
                    ..Job::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Workflow::default()
        };

        let container = {
            let state = parent.container.lock();
            ContainerState {
                job: state.job.clone(),
                services: Vec::new(),
                created_network: None,
            }
        };

        Ok(Arc::new(RunContext {
            config: parent.config.clone(),
            run: Run::new(Arc::new(workflow), job_id),
            services: parent.services.clone(),
            event_json: parent.event_json.clone(),
            matrix: parent.matrix.clone(),
            masks: parent.masks.clone(),
            stack,
            name: parent.name.clone(),
            action_path: action_path.to_string(),
            inputs: RwLock::new(inputs),
            needs: parent.needs.clone(),
            parent: Some(parent.clone()),
            env: EnvironmentState {
                shared: parent.env.shared.clone(),
                ..EnvironmentState::default()
            },
            outputs: Mutex::new(OutputState::default()),
            container: Mutex::new(container),
        }))
    }

    pub fn parent(&self) -> Option<&Arc<RunContext>> {
        self.parent.as_ref()
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.services.evaluator.as_ref()
    }

    /// The job entry point: evaluate the job condition, then run the job kind's executor.
    pub fn executor(self: &Arc<Self>) -> Operation {
        let rc = self.clone();
        Operation::new(move |cancel| {
            let rc = rc.clone();
            async move {
                if !rc.is_enabled()? {
                    return Ok(());
                }
                let op = match rc.run.job().kind() {
                    JobKind::Default => job_executor(rc.clone()),
                    JobKind::ReusableWorkflowLocal | JobKind::ReusableWorkflowRemote => {
                        reusable_workflow_executor(rc.clone())
                    }
                };
                op.run(cancel).await
            }
        })
    }

    /// Whether the job should run at all. An unresolvable platform is a skip, not an error.
    pub fn is_enabled(&self) -> Result<bool> {
        let job = self.run.job();
        let ctx = self.expression_context();
        let run_job = self
            .evaluator()
            .eval_bool(&ctx, job.condition(), DefaultStatusCheck::Success)?;
        if !run_job {
            tracing::debug!(target: "job", "Skipping job '{}' due to '{}'", self.name, job.condition());
            return Ok(false);
        }

        if job.kind() != JobKind::Default {
            return Ok(true);
        }

        if self.platform_image().is_empty() {
            if job.runs_on.is_empty() {
                tracing::error!(target: "job", "'runs-on' key not defined in {}", self);
            }
            for label in self.runs_on() {
                tracing::info!(target: "job", "🚧  Skipping unsupported platform -- Try running with `-P {}=...`", label);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Image for the job: the job container, the platform picker, then the label table.
    pub fn platform_image(&self) -> String {
        let job = self.run.job();
        if let Some(container) = job.container.as_ref().filter(|c| !c.image.is_empty()) {
            return self.interpolate(&container.image);
        }

        let runs_on = self.runs_on();
        if let Some(picker) = &self.config.platform_picker {
            if let Some(image) = (picker.0)(&runs_on).filter(|i| !i.is_empty()) {
                return image;
            }
        }
        runs_on
            .iter()
            .find_map(|label| self.config.platform_for_label(label))
            .unwrap_or_default()
            .to_string()
    }

    pub fn is_host_env(&self) -> bool {
        self.platform_image()
            .eq_ignore_ascii_case(act_common::constants::SELF_HOSTED_IMAGE)
    }

    /// Interpolated `runs-on` labels.
    pub fn runs_on(&self) -> Vec<String> {
        let ctx = self.expression_context();
        self.run
            .job()
            .runs_on
            .iter()
            .map(|label| self.evaluator().interpolate(&ctx, label))
            .collect()
    }

    pub fn interpolate(&self, template: &str) -> String {
        if !template.contains("${{") {
            return template.to_string();
        }
        self.evaluator().interpolate(&self.expression_context(), template)
    }

    // -- environment --------------------------------------------------------

    /// The job environment: workflow, job and configured env layered in that
    /// order, runtime `GITHUB_ENV` writes on top, and `ACT=true` always set.
    pub fn env(&self) -> HashMap<String, String> {
        let cached = self.env.merged.read().clone();
        let mut env = match cached {
            Some(env) => env,
            None => {
                let computed = self.layered_env();
                self.env
                    .merged
                    .write()
                    .get_or_insert(computed)
                    .clone()
            }
        };
        env.extend(self.env.shared.lock().global.clone());
        env.insert(variables::ACT.to_string(), "true".to_string());
        env
    }

    fn layered_env(&self) -> HashMap<String, String> {
        let mut env = match &self.parent {
            Some(parent) => parent.env(),
            None => {
                let mut env = self.run.workflow.env.clone();
                env.extend(self.run.job().env.clone());
                env.extend(self.config.env.clone());
                env
            }
        };
        env.extend(self.env.layer.read().clone());
        env
    }

    /// Replace the composite layer and the `inputs` context, and recompute
    /// the env from the parent's current state on next use.
    pub fn refresh_env(&self, layer: HashMap<String, String>, inputs: Map<String, Value>) {
        *self.env.layer.write() = layer;
        *self.inputs.write() = inputs;
        *self.env.merged.write() = None;
    }

    /// Add values to the merged env without overriding any that are already set.
    pub fn add_env_fallback(&self, values: impl IntoIterator<Item = (String, String)>) {
        if self.env.merged.read().is_none() {
            let computed = self.layered_env();
            self.env.merged.write().get_or_insert(computed);
        }
        let mut merged = self.env.merged.write();
        if let Some(env) = merged.as_mut() {
            for (key, value) in values {
                env.entry(key).or_insert(value);
            }
        }
    }

    /// Runtime env write (`GITHUB_ENV`), visible to the whole job.
    pub fn set_env(&self, name: &str, value: &str) {
        self.env
            .shared
            .lock()
            .global
            .insert(name.to_string(), value.to_string());
    }

    pub fn extra_path(&self) -> Vec<String> {
        self.env.shared.lock().extra_path.clone()
    }

    /// Prepend a segment to the extra path, most recent first.
    pub fn add_path(&self, segment: &str) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        self.env.shared.lock().extra_path.insert(0, segment.to_string());
    }

    // -- outputs ------------------------------------------------------------

    pub fn current_step(&self) -> String {
        self.outputs.lock().current_step.clone()
    }

    pub fn set_current_step(&self, step_id: &str) {
        self.outputs.lock().current_step = step_id.to_string();
    }

    pub fn step_results(&self) -> StepResults {
        self.outputs.lock().step_results.clone()
    }

    pub fn record_step(&self, step_id: &str, outcome: StepStatus, continue_on_error: bool) {
        self.outputs
            .lock()
            .step_results
            .record(step_id, outcome, continue_on_error);
    }

    pub fn ensure_step_result(&self, step_id: &str) {
        self.outputs.lock().step_results.ensure(step_id);
    }

    /// Record a step output, forwarding it to the enclosing step when mapped.
    pub fn set_output(&self, step_id: &str, name: &str, value: &str) {
        let mapped = {
            let mut outputs = self.outputs.lock();
            outputs.step_results.set_output(step_id, name, value);
            outputs
                .output_mappings
                .get(&MappableOutput {
                    step_id: step_id.to_string(),
                    output_name: name.to_string(),
                })
                .cloned()
        };
        if let (Some(target), Some(parent)) = (mapped, &self.parent) {
            parent.set_output(&target.step_id, &target.output_name, value);
        }
    }

    pub fn add_output_mapping(&self, from: MappableOutput, to: MappableOutput) {
        self.outputs.lock().output_mappings.insert(from, to);
    }

    pub fn save_state(&self, action: &str, name: &str, value: &str) {
        self.outputs
            .lock()
            .intra_action_state
            .entry(action.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn action_state(&self, action: &str) -> HashMap<String, String> {
        self.outputs
            .lock()
            .intra_action_state
            .get(action)
            .cloned()
            .unwrap_or_default()
    }

    /// `job.status`, never better than the enclosing run's.
    pub fn job_status(&self) -> StepStatus {
        let own = self.outputs.lock().step_results.job_status();
        match &self.parent {
            Some(parent) => StepStatus::merge(Some(parent.job_status()), own),
            None => own,
        }
    }

    pub fn job_outputs(&self) -> HashMap<String, String> {
        self.outputs.lock().job_outputs.clone()
    }

    /// Outputs of a reusable-workflow job, taken from the called workflow.
    pub fn set_job_outputs(&self, outputs: HashMap<String, String>) {
        self.outputs.lock().job_outputs = outputs;
    }

    /// Interpolate the declared job outputs once the steps are done.
    pub fn interpolate_outputs(&self) {
        let ctx = self.expression_context();
        let declared = self.run.job().outputs.clone();
        let interpolated = self.evaluator().interpolate_map(&ctx, &declared);
        self.outputs.lock().job_outputs = interpolated;
    }

    // -- containers ---------------------------------------------------------

    pub fn job_container(&self) -> Option<Arc<dyn ExecutionEnvironment>> {
        self.container.lock().job.clone()
    }

    pub fn service_containers(&self) -> Vec<Arc<dyn ExecutionEnvironment>> {
        self.container.lock().services.clone()
    }

    /// Path of a state file (`workflow/...`) inside the job environment.
    pub fn state_file_path(&self, file: &str) -> String {
        let act_path = self
            .job_container()
            .map(|c| c.act_path())
            .unwrap_or_else(|| paths::ACT_PATH.to_string());
        format!("{act_path}/{file}")
    }

    /// Workspace path as seen from inside the job environment.
    pub fn container_workdir(&self) -> String {
        match self.job_container() {
            Some(c) => c.to_container_path(&self.config.workdir),
            None => self.config.workdir.to_string_lossy().into_owned(),
        }
    }

    // -- contexts -----------------------------------------------------------

    pub fn github_context(&self) -> GitHubContext {
        let current_step = self.current_step();
        let container = self.job_container();
        let inputs = ContextInputs {
            workflow_name: &self.run.workflow.name,
            job_id: &self.run.job_id,
            current_step: &current_step,
            action_path: &self.action_path,
            event_json: &self.event_json,
            event_path: container
                .as_ref()
                .map(|c| format!("{}/{}", c.act_path(), state_files::EVENT_JSON)),
            workspace: container
                .as_ref()
                .map(|c| c.to_container_path(&self.config.workdir)),
        };
        GitHubContext::build(&self.config, &inputs)
    }

    fn runner_context(&self) -> Value {
        let values = match self.job_container() {
            Some(c) => c.runner_context(),
            None => HashMap::from([
                ("os".to_string(), "Linux".to_string()),
                ("temp".to_string(), paths::RUNNER_TEMP.to_string()),
                ("tool_cache".to_string(), paths::HOSTED_TOOL_CACHE.to_string()),
            ]),
        };
        json!(values)
    }

    fn job_context(&self) -> Value {
        let state = self.container.lock();
        let services: Map<String, Value> = self
            .run
            .job()
            .services
            .keys()
            .zip(state.services.iter())
            .map(|(id, c)| (id.clone(), json!({ "id": c.name() })))
            .collect();
        json!({
            "status": self.job_status().as_str(),
            "container": {
                "id": state.job.as_ref().map(|c| c.name().to_string()).unwrap_or_default(),
                "network": state.created_network.clone().unwrap_or_else(|| self.config.container_network_mode.clone()),
            },
            "services": services,
        })
    }

    /// The contexts visible to expressions evaluated in this run context.
    pub fn expression_context(&self) -> ExpressionContext {
        let mut ctx = ExpressionContext {
            job_status: self.job_status(),
            ..ExpressionContext::default()
        };
        ctx.insert("github", self.github_context().to_value());
        ctx.insert("env", json!(self.env()));
        ctx.insert("job", self.job_context());
        ctx.insert("steps", self.outputs.lock().step_results.to_value());
        ctx.insert("runner", self.runner_context());
        ctx.insert("matrix", Value::Object(self.matrix.clone()));
        ctx.insert("strategy", json!({}));
        ctx.insert("inputs", Value::Object(self.inputs.read().clone()));
        ctx.insert("needs", Value::Object(self.needs.clone()));
        ctx.insert("secrets", json!(self.config.secrets));
        ctx.insert("vars", json!(self.config.vars));
        ctx
    }

    /// Env for a step process: job env, the step's own env, the trigger
    /// context variables and the extra path.
    pub async fn step_env(
        &self,
        step_env: HashMap<String, String>,
        ghc: &GitHubContext,
        cancel: tokio_util::sync::CancellationToken,
    ) -> HashMap<String, String> {
        let mut env = self.env();
        env.extend(step_env);
        with_github_env(ghc, &self.config, &self.runs_on(), &mut env);
        self.apply_extra_path(&mut env, cancel).await;
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job_workflow, services, RecordingDriver};

    fn context(workflow: &str, config: Config) -> Arc<RunContext> {
        let (workflow, job_id) = job_workflow(workflow);
        RunContext::new(NewRunContext {
            config: Arc::new(config),
            run: Run::new(workflow, job_id),
            services: services(RecordingDriver::new()),
            event_json: "{}".to_string(),
            matrix: Map::new(),
            inputs: Map::new(),
            needs: Map::new(),
            stack: CallStack::root("build"),
            masks: None,
        })
    }

    #[test]
    fn test_env_layers_and_act_marker() {
        let mut config = Config::default();
        config.env.insert("SHARED".into(), "config".into());
        let rc = context(
            "env:\n  SHARED: workflow\n  WF: w\njobs:\n  build:\n    runs-on: ubuntu-latest\n    env:\n      JOB: j\n    steps: []\n",
            config,
        );
        let env = rc.env();
        assert_eq!(env["SHARED"], "config");
        assert_eq!(env["WF"], "w");
        assert_eq!(env["JOB"], "j");
        assert_eq!(env["ACT"], "true");

        rc.set_env("RUNTIME", "1");
        assert_eq!(rc.env()["RUNTIME"], "1");
    }

    #[test]
    fn test_platform_image_resolution_order() {
        let mut config = Config::default();
        config.platforms.insert("ubuntu-latest".into(), "node:20".into());
        let rc = context("jobs:\n  build:\n    runs-on: Ubuntu-Latest\n    steps: []\n", config.clone());
        assert_eq!(rc.platform_image(), "node:20");

        let picked = config.clone().with_platform_picker(|_| Some("picked:1".into()));
        let rc = context("jobs:\n  build:\n    runs-on: ubuntu-latest\n    steps: []\n", picked);
        assert_eq!(rc.platform_image(), "picked:1");

        let rc = context(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    container: alpine:3\n    steps: []\n",
            config,
        );
        assert_eq!(rc.platform_image(), "alpine:3");
    }

    #[test]
    fn test_unresolved_platform_is_not_enabled() {
        let rc = context("jobs:\n  build:\n    runs-on: windows-latest\n    steps: []\n", Config::default());
        assert!(!rc.is_enabled().unwrap());
    }

    #[test]
    fn test_bad_job_condition_is_evaluation_error() {
        let rc = context(
            "jobs:\n  build:\n    runs-on: x\n    if: \"github.event_name ==\"\n    steps: []\n",
            Config::default(),
        );
        let err = rc.is_enabled().unwrap_err();
        assert!(matches!(
            crate::error::runner_error(&err),
            Some(crate::error::RunnerError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_display_includes_caller_job() {
        let rc = context("name: ci\njobs:\n  build:\n    runs-on: x\n    steps: []\n", Config::default());
        assert_eq!(rc.to_string(), "ci/build");

        let (workflow, job_id) = job_workflow("name: lib\njobs:\n  test:\n    runs-on: x\n    steps: []\n");
        let stack = CallStack::root("caller")
            .push(Frame::ReusableWorkflow {
                caller_job: "caller".into(),
                uses: "./.github/workflows/lib.yml".into(),
            })
            .unwrap();
        let child = RunContext::new(NewRunContext {
            config: rc.config.clone(),
            run: Run::new(workflow, job_id),
            services: rc.services.clone(),
            event_json: "{}".into(),
            matrix: Map::new(),
            inputs: Map::new(),
            needs: Map::new(),
            stack,
            masks: Some(rc.masks.clone()),
        });
        assert_eq!(child.to_string(), "caller/lib/test");
    }

    #[test]
    fn test_composite_child_shares_env_but_not_results() {
        let rc = context("jobs:\n  build:\n    runs-on: x\n    steps: []\n", Config::default());
        rc.record_step("outer", StepStatus::Success, false);
        let child = RunContext::composite_child(&rc, "outer", "./action", "/act/actions/x", Vec::new(), Map::new()).unwrap();

        child.set_env("FROM_CHILD", "yes");
        assert_eq!(rc.env()["FROM_CHILD"], "yes");
        child.add_path("/opt/tool/bin");
        assert_eq!(rc.extra_path(), vec!["/opt/tool/bin".to_string()]);
        assert!(child.step_results().get("outer").is_none());

        let inputs: Map<String, Value> = [("name".to_string(), json!("x"))].into_iter().collect();
        child.refresh_env(HashMap::from([("INPUT_NAME".to_string(), "x".to_string())]), inputs);
        assert_eq!(child.env()["INPUT_NAME"], "x");
        assert_eq!(child.expression_context().get("inputs"), Some(&json!({"name": "x"})));
        assert!(!rc.env().contains_key("INPUT_NAME"));
    }

    #[test]
    fn test_output_mapping_forwards_to_parent() {
        let rc = context("jobs:\n  build:\n    runs-on: x\n    steps: []\n", Config::default());
        let child = RunContext::composite_child(&rc, "outer", "./action", "", Vec::new(), Map::new()).unwrap();
        child.add_output_mapping(
            MappableOutput { step_id: "inner".into(), output_name: "v".into() },
            MappableOutput { step_id: "outer".into(), output_name: "version".into() },
        );
        child.set_output("inner", "v", "1.2.3");
        assert_eq!(rc.step_results().output("outer", "version"), Some("1.2.3"));
    }

    #[test]
    fn test_composite_depth_limit() {
        let mut stack = CallStack::root("job");
        for depth in 0..COMPOSITE_ACTIONS_MAX_DEPTH {
            stack = stack
                .push(Frame::Composite { step_id: depth.to_string(), action: "./a".into() })
                .unwrap();
        }
        assert!(stack
            .push(Frame::Composite { step_id: "deep".into(), action: "./a".into() })
            .is_err());
    }

    #[test]
    fn test_job_status_follows_step_conclusions() {
        let rc = context("jobs:\n  build:\n    runs-on: x\n    steps: []\n", Config::default());
        rc.record_step("a", StepStatus::Failure, true);
        assert_eq!(rc.job_status(), StepStatus::Success);
        rc.record_step("b", StepStatus::Failure, false);
        assert_eq!(rc.job_status(), StepStatus::Failure);
        let child = RunContext::composite_child(&rc, "b", "./a", "", Vec::new(), Map::new()).unwrap();
        assert_eq!(child.job_status(), StepStatus::Failure);
    }

    #[test]
    fn test_interpolate_outputs() {
        let rc = context(
            "jobs:\n  build:\n    runs-on: x\n    outputs:\n      version: ${{ steps.meta.outputs.v }}\n      fixed: plain\n    steps: []\n",
            Config::default(),
        );
        rc.set_output("meta", "v", "9");
        rc.interpolate_outputs();
        let outputs = rc.job_outputs();
        assert_eq!(outputs["version"], "9");
        assert_eq!(outputs["fixed"], "plain");
    }
}
