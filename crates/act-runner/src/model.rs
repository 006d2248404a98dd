// Job / step data model as read from workflow YAML, plus the kind discriminators
// the engine dispatches on.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A parsed workflow file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub name: String,
    #[serde(rename = "on")]
    pub on: Value,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    pub jobs: BTreeMap<String, Job>,
    pub defaults: Defaults,
}

impl Workflow {
    /// Events this workflow is triggered by (`on: push`, `on: [push, pull_request]`, `on: {push: ...}`).
    pub fn events(&self) -> Vec<String> {
        match &self.on {
            Value::String(s) => vec![s.clone()],
            Value::Sequence(seq) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::Mapping(map) => map
                .iter()
                .filter_map(|(k, _)| k.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Inputs declared under `on.workflow_call.inputs`, with their defaults.
    pub fn workflow_call_input_defaults(&self) -> HashMap<String, String> {
        let mut defaults = HashMap::new();
        let inputs = self
            .on
            .get("workflow_call")
            .and_then(|call| call.get("inputs"))
            .and_then(Value::as_mapping);
        if let Some(inputs) = inputs {
            for (name, spec) in inputs {
                let (Some(name), Some(default)) = (name.as_str(), spec.get("default")) else {
                    continue;
                };
                if let Some(value) = scalar_to_string(default) {
                    defaults.insert(name.to_string(), value);
                }
            }
        }
        defaults
    }

    /// Outputs declared under `on.workflow_call.outputs`, as `value` templates.
    pub fn workflow_call_outputs(&self) -> HashMap<String, String> {
        let outputs = self
            .on
            .get("workflow_call")
            .and_then(|call| call.get("outputs"))
            .and_then(Value::as_mapping);
        let Some(outputs) = outputs else {
            return HashMap::new();
        };
        outputs
            .iter()
            .filter_map(|(name, spec)| {
                let value = spec.get("value").and_then(scalar_to_string)?;
                Some((name.as_str()?.to_string(), value))
            })
            .collect()
    }
}

/// Kind of a job, decided by its `uses:` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Default,
    ReusableWorkflowLocal,
    ReusableWorkflowRemote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Job {
    pub name: Option<String>,
    #[serde(deserialize_with = "string_or_seq")]
    pub needs: Vec<String>,
    #[serde(deserialize_with = "runs_on")]
    pub runs_on: Vec<String>,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(rename = "if", deserialize_with = "opt_scalar")]
    pub condition: Option<String>,
    pub steps: Vec<Step>,
    pub services: BTreeMap<String, ContainerSpec>,
    #[serde(deserialize_with = "container_spec")]
    pub container: Option<ContainerSpec>,
    #[serde(deserialize_with = "string_map")]
    pub outputs: HashMap<String, String>,
    pub uses: Option<String>,
    #[serde(deserialize_with = "string_map")]
    pub with: HashMap<String, String>,
    pub strategy: Option<Strategy>,
    pub defaults: Defaults,
    #[serde(deserialize_with = "opt_scalar")]
    pub timeout_minutes: Option<String>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self.uses.as_deref() {
            None | Some("") => JobKind::Default,
            Some(uses) if uses.starts_with("./") => JobKind::ReusableWorkflowLocal,
            // Anything else is parsed as a remote reference; a malformed value
            // surfaces as a reference error when the job runs.
            Some(_) => JobKind::ReusableWorkflowRemote,
        }
    }

    /// The job condition, defaulting to `success()`.
    pub fn condition(&self) -> &str {
        match self.condition.as_deref() {
            Some(c) if !c.trim().is_empty() => c,
            _ => "success()",
        }
    }
}

/// Kind of a step, decided by its `run:` / `uses:` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Run,
    Docker,
    RemoteAction,
    LocalAction,
    Invalid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Step {
    pub id: String,
    #[serde(rename = "if", deserialize_with = "opt_scalar")]
    pub condition: Option<String>,
    pub name: Option<String>,
    pub uses: Option<String>,
    pub run: Option<String>,
    pub working_directory: Option<String>,
    pub shell: Option<String>,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(deserialize_with = "string_map")]
    pub with: HashMap<String, String>,
    #[serde(deserialize_with = "opt_scalar")]
    pub continue_on_error: Option<String>,
    #[serde(deserialize_with = "opt_scalar")]
    pub timeout_minutes: Option<String>,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        let run = self.run.as_deref().filter(|r| !r.is_empty());
        let uses = self.uses.as_deref().filter(|u| !u.is_empty());
        match (run, uses) {
            (Some(_), None) => StepKind::Run,
            (None, Some(uses)) if uses.starts_with("docker://") => StepKind::Docker,
            (None, Some(uses)) if uses.starts_with("./") => StepKind::LocalAction,
            (None, Some(_)) => StepKind::RemoteAction,
            _ => StepKind::Invalid,
        }
    }

    /// The step condition, defaulting to `success()`.
    pub fn condition(&self) -> &str {
        match self.condition.as_deref() {
            Some(c) if !c.trim().is_empty() => c,
            _ => "success()",
        }
    }

    /// Display name: explicit name, else the `uses`/`run` value, else the id.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if let Some(uses) = self.uses.as_deref().filter(|u| !u.is_empty()) {
            return uses.to_string();
        }
        if let Some(run) = self.run.as_deref() {
            return run.lines().next().unwrap_or_default().to_string();
        }
        self.id.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(deserialize_with = "string_map")]
    pub env: HashMap<String, String>,
    #[serde(deserialize_with = "string_list")]
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub options: String,
    #[serde(deserialize_with = "opt_string_map")]
    pub credentials: Option<HashMap<String, String>>,
    #[serde(deserialize_with = "string_or_seq")]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Strategy {
    pub matrix: Value,
    pub fail_fast: Option<bool>,
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub run: RunDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunDefaults {
    pub shell: Option<String>,
    pub working_directory: Option<String>,
}

/// One planned execution of a job: the workflow it belongs to plus the job id.
#[derive(Debug, Clone)]
pub struct Run {
    pub workflow: Arc<Workflow>,
    pub job_id: String,
}

impl Run {
    pub fn new(workflow: Arc<Workflow>, job_id: impl Into<String>) -> Self {
        Self {
            workflow,
            job_id: job_id.into(),
        }
    }

    /// The job this run executes. Plans only reference existing job ids.
    pub fn job(&self) -> &Job {
        static EMPTY: once_cell::sync::Lazy<Job> = once_cell::sync::Lazy::new(Job::default);
        self.workflow.jobs.get(&self.job_id).unwrap_or(&EMPTY)
    }

    pub fn job_name(&self) -> String {
        self.job().name.clone().unwrap_or_else(|| self.job_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Lenient deserializers: YAML scalars are accepted wherever a string is expected.
// ---------------------------------------------------------------------------

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn value_to_string_map<E: de::Error>(value: Value) -> Result<HashMap<String, String>, E> {
    match value {
        Value::Null => Ok(HashMap::new()),
        Value::Mapping(map) => {
            let mut out = HashMap::with_capacity(map.len());
            for (k, v) in map {
                let key = scalar_to_string(&k).ok_or_else(|| E::custom("mapping key must be a scalar"))?;
                let value = match scalar_to_string(&v) {
                    Some(s) => s,
                    None => serde_json::to_string(&v).map_err(E::custom)?,
                };
                out.insert(key, value);
            }
            Ok(out)
        }
        other => Err(E::custom(format!("expected a mapping, found {other:?}"))),
    }
}

pub(crate) fn string_map<'de, D: Deserializer<'de>>(d: D) -> Result<HashMap<String, String>, D::Error> {
    value_to_string_map(Value::deserialize(d)?)
}

fn opt_string_map<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<HashMap<String, String>>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        other => value_to_string_map(other).map(Some),
    }
}

pub(crate) fn opt_scalar<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        other => scalar_to_string(&other)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a scalar value")),
    }
}

fn seq_of_strings<E: de::Error>(value: Value) -> Result<Vec<String>, E> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| scalar_to_string(v).ok_or_else(|| E::custom("expected a list of scalars")))
            .collect(),
        other => scalar_to_string(&other)
            .map(|s| vec![s])
            .ok_or_else(|| E::custom("expected a string or a list of strings")),
    }
}

pub(crate) fn string_or_seq<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    seq_of_strings(Value::deserialize(d)?)
}

fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    seq_of_strings(Value::deserialize(d)?)
}

/// `runs-on` is a label, a list of labels, or `{group, labels}`.
fn runs_on<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Mapping(map) => {
            let labels = map.get("labels").cloned().unwrap_or(Value::Null);
            seq_of_strings(labels)
        }
        other => seq_of_strings(other),
    }
}

/// `container` is either an image name or a full spec.
fn container_spec<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ContainerSpec>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(image) => Ok(Some(ContainerSpec {
            image,
            ..ContainerSpec::default()
        })),
        other => serde_yaml::from_value(other)
            .map(Some)
            .map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
name: ci
on: [push, workflow_call]
env:
  RETRIES: 3
jobs:
  build:
    runs-on: ubuntu-latest
    container: node:20
    services:
      redis:
        image: redis:7
        credentials:
          username: ${{ secrets.USER }}
          password: ${{ secrets.PASS }}
    steps:
      - uses: actions/checkout@v4
      - run: echo hi
        continue-on-error: true
      - uses: docker://alpine:3
      - uses: ./.github/actions/local
  deploy:
    needs: build
    uses: octocat/hello-world/.github/workflows/ci.yml@v1
  local:
    uses: ./.gitea/workflows/build.yml
"#;

    fn parse() -> Workflow {
        serde_yaml::from_str(WORKFLOW).unwrap()
    }

    #[test]
    fn test_parse_workflow() {
        let wf = parse();
        assert_eq!(wf.name, "ci");
        assert_eq!(wf.events(), vec!["push", "workflow_call"]);
        assert_eq!(wf.env.get("RETRIES").map(String::as_str), Some("3"));
        let build = &wf.jobs["build"];
        assert_eq!(build.runs_on, vec!["ubuntu-latest"]);
        assert_eq!(build.container.as_ref().unwrap().image, "node:20");
        let creds = build.services["redis"].credentials.as_ref().unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(build.steps[1].continue_on_error.as_deref(), Some("true"));
        assert_eq!(wf.jobs["deploy"].needs, vec!["build"]);
    }

    #[test]
    fn test_job_kinds() {
        let wf = parse();
        assert_eq!(wf.jobs["build"].kind(), JobKind::Default);
        assert_eq!(wf.jobs["deploy"].kind(), JobKind::ReusableWorkflowRemote);
        assert_eq!(wf.jobs["local"].kind(), JobKind::ReusableWorkflowLocal);
    }

    #[test]
    fn test_step_kinds() {
        let wf = parse();
        let kinds: Vec<StepKind> = wf.jobs["build"].steps.iter().map(Step::kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::RemoteAction,
                StepKind::Run,
                StepKind::Docker,
                StepKind::LocalAction
            ]
        );
        let both = Step {
            run: Some("echo".into()),
            uses: Some("a/b@v1".into()),
            ..Step::default()
        };
        assert_eq!(both.kind(), StepKind::Invalid);
        assert_eq!(Step::default().kind(), StepKind::Invalid);
    }

    #[test]
    fn test_runs_on_group_form() {
        let job: Job = serde_yaml::from_str("runs-on: {group: big, labels: [linux, x64]}").unwrap();
        assert_eq!(job.runs_on, vec!["linux", "x64"]);
    }

    #[test]
    fn test_default_conditions() {
        let step = Step::default();
        assert_eq!(step.condition(), "success()");
        assert_eq!(Job::default().condition(), "success()");
    }

    #[test]
    fn test_workflow_call_input_defaults() {
        let wf: Workflow = serde_yaml::from_str(
            "on:\n  workflow_call:\n    inputs:\n      level:\n        type: number\n        default: 2\njobs: {}\n",
        )
        .unwrap();
        assert_eq!(wf.workflow_call_input_defaults().get("level").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_workflow_call_outputs() {
        let wf: Workflow = serde_yaml::from_str(
            "on:\n  workflow_call:\n    outputs:\n      version:\n        value: ${{ jobs.build.outputs.v }}\njobs: {}\n",
        )
        .unwrap();
        assert_eq!(
            wf.workflow_call_outputs().get("version").map(String::as_str),
            Some("${{ jobs.build.outputs.v }}")
        );
        assert!(Workflow::default().workflow_call_outputs().is_empty());
    }
}
