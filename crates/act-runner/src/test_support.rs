// Test doubles shared by the unit tests: a container driver that records
// every call instead of talking to a daemon, and a fetcher that counts clones.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Map;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::constants::container as paths;

use crate::config::Config;
use crate::container::{ContainerDriver, ContainerInput, ExecRequest, ExecutionEnvironment, FileEntry};
use crate::error::RunnerError;
use crate::expressions::{BasicEvaluator, DefaultStatusCheck, ExpressionContext, ExpressionEvaluator};
use crate::model::{Run, Workflow};
use crate::planner::YamlWorkflowPlanner;
use crate::run_context::{CallStack, NewRunContext, RunContext, RunnerServices};
use crate::source_cache::{FetchError, FetchRequest, SourceCache, SourceFetcher};

// ---------------------------------------------------------------------------
// Recording driver
// ---------------------------------------------------------------------------

/// What a scripted `exec` does when its command line contains `matches`.
#[derive(Debug, Clone, Default)]
pub struct ExecAction {
    pub matches: String,
    pub fail: bool,
    /// Lines sent to the request's line handler.
    pub stdout: Vec<String>,
    /// `(env var, content)`: append `content` to the file named by the env var.
    pub append: Vec<(String, String)>,
}

#[derive(Default)]
struct Recorder {
    ops: Mutex<Vec<String>>,
    inputs: Mutex<Vec<ContainerInput>>,
    files: Mutex<BTreeMap<String, String>>,
    execs: Mutex<Vec<ExecRequest>>,
    script: Mutex<Vec<ExecAction>>,
}

impl Recorder {
    fn record(&self, op: String) {
        self.ops.lock().push(op);
    }
}

#[derive(Default)]
pub struct RecordingDriver {
    recorder: Arc<Recorder>,
}

impl RecordingDriver {
    pub fn new() -> Arc<RecordingDriver> {
        Arc::new(RecordingDriver::default())
    }

    pub fn ops(&self) -> Vec<String> {
        self.recorder.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.recorder.ops.lock().clear();
    }

    pub fn input(&self, name: &str) -> Option<ContainerInput> {
        self.recorder.inputs.lock().iter().find(|i| i.name == name).cloned()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.recorder.files.lock().get(path).cloned()
    }

    pub fn write_file(&self, path: &str, content: &str) {
        self.recorder.files.lock().insert(path.to_string(), content.to_string());
    }

    pub fn execs(&self) -> Vec<ExecRequest> {
        self.recorder.execs.lock().clone()
    }

    pub fn on_exec(&self, action: ExecAction) {
        self.recorder.script.lock().push(action);
    }
}

#[async_trait]
impl ContainerDriver for RecordingDriver {
    fn new_container(&self, input: ContainerInput) -> Option<Arc<dyn ExecutionEnvironment>> {
        if input.image.is_empty() || input.name.is_empty() {
            return None;
        }
        self.recorder.inputs.lock().push(input.clone());
        Some(Arc::new(RecordingContainer {
            name: input.name,
            recorder: self.recorder.clone(),
        }))
    }

    async fn create_network(&self, name: &str, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("network-create:{name}"));
        Ok(())
    }

    async fn remove_network(&self, name: &str, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("network-rm:{name}"));
        Ok(())
    }

    async fn remove_volume(&self, name: &str, _force: bool, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("volume-rm:{name}"));
        Ok(())
    }
}

struct RecordingContainer {
    name: String,
    recorder: Arc<Recorder>,
}

fn join(dest: &str, name: &str) -> String {
    if dest.ends_with('/') {
        format!("{dest}{name}")
    } else {
        format!("{dest}/{name}")
    }
}

#[async_trait]
impl ExecutionEnvironment for RecordingContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, _force: bool, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("pull:{}", self.name));
        Ok(())
    }

    async fn create(&self, _cap_add: &[String], _cap_drop: &[String], _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("create:{}", self.name));
        Ok(())
    }

    async fn start(&self, _attach: bool, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("start:{}", self.name));
        Ok(())
    }

    async fn exec(&self, request: ExecRequest, _cancel: CancellationToken) -> Result<()> {
        let command = request.command.join(" ");
        self.recorder.record(format!("exec:{}:{}", self.name, command));
        self.recorder.execs.lock().push(request.clone());

        let actions: Vec<ExecAction> = self
            .recorder
            .script
            .lock()
            .iter()
            .filter(|a| command.contains(&a.matches))
            .cloned()
            .collect();
        for action in actions {
            if let Some(handler) = &request.on_line {
                for line in &action.stdout {
                    handler(line);
                }
            }
            for (variable, content) in &action.append {
                if let Some(path) = request.env.get(variable) {
                    self.recorder
                        .files
                        .lock()
                        .entry(path.clone())
                        .or_default()
                        .push_str(content);
                }
            }
            if action.fail {
                anyhow::bail!("exitcode '1': failure");
            }
        }
        Ok(())
    }

    async fn copy(&self, dest: &str, files: Vec<FileEntry>, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("copy:{dest}"));
        let mut stored = self.recorder.files.lock();
        for file in files {
            stored.insert(join(dest, &file.name), file.body);
        }
        Ok(())
    }

    async fn copy_dir(&self, dest: &str, _src: &Path, _use_gitignore: bool, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("copy-dir:{dest}"));
        Ok(())
    }

    async fn read_file(&self, path: &str, _cancel: CancellationToken) -> Result<Option<String>> {
        Ok(self.recorder.files.lock().get(path).cloned())
    }

    async fn remove(&self, _cancel: CancellationToken) -> Result<()> {
        self.recorder.record(format!("remove:{}", self.name));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn to_container_path(&self, host_path: &Path) -> String {
        host_path.to_string_lossy().into_owned()
    }

    fn act_path(&self) -> String {
        paths::ACT_PATH.to_string()
    }

    fn runner_context(&self) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::from([
            ("os".to_string(), "Linux".to_string()),
            ("arch".to_string(), "X64".to_string()),
            ("temp".to_string(), paths::RUNNER_TEMP.to_string()),
            ("tool_cache".to_string(), paths::HOSTED_TOOL_CACHE.to_string()),
        ])
    }
}

// ---------------------------------------------------------------------------
// Counting fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok,
    ShortRef(String),
    ForceNeeded,
    Fail(String),
}

/// Fetcher that records requests and, on success, creates the target
/// directory with the configured files.
pub struct CountingFetcher {
    outcome: FetchOutcome,
    files: Vec<(String, String)>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl CountingFetcher {
    pub fn new(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            files: Vec::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file(mut self, relative: &str, content: &str) -> Self {
        self.files.push((relative.to_string(), content.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SourceFetcher for CountingFetcher {
    async fn clone_source(&self, request: &FetchRequest, _cancel: CancellationToken) -> Result<(), FetchError> {
        self.requests.lock().push(request.clone());
        // Give concurrent callers a chance to race on the lock.
        tokio::task::yield_now().await;
        match &self.outcome {
            FetchOutcome::Ok => {
                std::fs::create_dir_all(&request.target_dir).map_err(anyhow::Error::from)?;
                for (relative, content) in &self.files {
                    let path = request.target_dir.join(relative);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
                    }
                    std::fs::write(&path, content).map_err(anyhow::Error::from)?;
                }
                Ok(())
            }
            FetchOutcome::ShortRef(full_sha) => Err(FetchError::ShortRef {
                full_sha: full_sha.clone(),
            }),
            FetchOutcome::ForceNeeded => Err(FetchError::ForceNeeded(request.reference.clone())),
            FetchOutcome::Fail(message) => Err(FetchError::Other(anyhow::anyhow!(message.clone()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted evaluator
// ---------------------------------------------------------------------------

/// Answers conditions from a fixed table and delegates everything else to
/// [`BasicEvaluator`]. A `None` answer makes evaluation fail.
#[derive(Default)]
pub struct ScriptedEvaluator {
    answers: std::collections::HashMap<String, Option<bool>>,
    inner: BasicEvaluator,
}

impl ScriptedEvaluator {
    pub fn answer(mut self, expression: &str, value: Option<bool>) -> Self {
        self.answers.insert(expression.to_string(), value);
        self
    }
}

impl ExpressionEvaluator for ScriptedEvaluator {
    fn interpolate(&self, ctx: &ExpressionContext, template: &str) -> String {
        self.inner.interpolate(ctx, template)
    }

    fn eval_bool(&self, ctx: &ExpressionContext, expression: &str, default_status: DefaultStatusCheck) -> Result<bool> {
        match self.answers.get(expression) {
            Some(Some(value)) => Ok(*value),
            Some(None) => Err(RunnerError::Evaluation {
                expression: expression.to_string(),
                message: "scripted failure".to_string(),
            }
            .into()),
            None => self.inner.eval_bool(ctx, expression, default_status),
        }
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Parse a workflow and return it with the id of its first job.
pub fn job_workflow(yaml: &str) -> (Arc<Workflow>, String) {
    let workflow: Workflow = serde_yaml::from_str(yaml).expect("test workflow parses");
    let job_id = workflow.jobs.keys().next().cloned().unwrap_or_default();
    (Arc::new(workflow), job_id)
}

pub fn services_with(driver: Arc<RecordingDriver>, config: &Config, fetcher: Arc<CountingFetcher>) -> Arc<RunnerServices> {
    Arc::new(RunnerServices {
        driver,
        cache: Arc::new(SourceCache::from_config(config, fetcher)),
        evaluator: Arc::new(BasicEvaluator::new()),
        planner: Arc::new(YamlWorkflowPlanner),
        http: reqwest::Client::new(),
    })
}

pub fn services(driver: Arc<RecordingDriver>) -> Arc<RunnerServices> {
    services_with(driver, &Config::default(), Arc::new(CountingFetcher::new(FetchOutcome::Ok)))
}

pub fn context_for(yaml: &str, config: Config, services: Arc<RunnerServices>) -> Arc<RunContext> {
    let (workflow, job_id) = job_workflow(yaml);
    RunContext::new(NewRunContext {
        config: Arc::new(config),
        stack: CallStack::root(&job_id),
        run: Run::new(workflow, job_id),
        services,
        event_json: "{}".to_string(),
        matrix: Map::new(),
        inputs: Map::new(),
        needs: Map::new(),
        masks: None,
    })
}

/// A run context for the first job of `yaml`, backed by a recording driver.
pub fn context_with(yaml: &str, config: Config) -> (Arc<RunContext>, Arc<RecordingDriver>) {
    let driver = RecordingDriver::new();
    let services = services_with(driver.clone(), &config, Arc::new(CountingFetcher::new(FetchOutcome::Ok)));
    (context_for(yaml, config, services), driver)
}

pub fn simple_context(yaml: &str) -> Arc<RunContext> {
    context_with(yaml, Config::default()).0
}

/// Config whose `ubuntu-latest` label maps to an image, rooted at `workdir`.
pub fn container_config(workdir: &Path) -> Config {
    let mut config = Config::default();
    config.workdir = workdir.to_path_buf();
    config
        .platforms
        .insert("ubuntu-latest".to_string(), "node:20".to_string());
    config
}
