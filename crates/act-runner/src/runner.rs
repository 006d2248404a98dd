// Plan execution: runs the jobs of a plan stage by stage, feeding each job the
// results of the jobs it needs. Reusable-workflow jobs run a nested plan
// through the same runner.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::RunnerError;
use crate::model::Run;
use crate::pipeline::Operation;
use crate::planner::Plan;
use crate::reference::WorkflowSource;
use crate::run_context::{CallStack, Frame, NewRunContext, RunContext, RunnerServices};

/// Final state of a job, as seen by the jobs that need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure,
    Skipped,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Failure => "failure",
            JobResult::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub result: JobResult,
    pub outputs: HashMap<String, String>,
}

impl JobOutcome {
    fn to_value(&self) -> Value {
        json!({
            "result": self.result.as_str(),
            "outputs": self.outputs,
        })
    }
}

pub struct Runner {
    config: Arc<Config>,
    services: Arc<RunnerServices>,
    event_json: String,
    /// Run context of the job that called this runner's workflow.
    caller: Option<Arc<RunContext>>,
}

impl Runner {
    pub fn new(config: Arc<Config>, services: Arc<RunnerServices>) -> Result<Runner> {
        let event_json = config.event_json()?;
        Ok(Runner {
            config,
            services,
            event_json,
            caller: None,
        })
    }

    /// A runner for the workflow called by `caller`, sharing its
    /// configuration, services and trigger payload.
    fn for_caller(caller: &Arc<RunContext>) -> Runner {
        Runner {
            config: caller.config.clone(),
            services: caller.services.clone(),
            event_json: caller.event_json.clone(),
            caller: Some(caller.clone()),
        }
    }

    /// Run every job of `plan`, one at a time, stage by stage.
    ///
    /// A failed job does not stop the plan; jobs that need it are skipped
    /// unless they carry their own condition. The first job error is
    /// returned once the plan is done.
    pub async fn run(&self, plan: &Plan, cancel: CancellationToken) -> Result<BTreeMap<String, JobOutcome>> {
        let mut outcomes: BTreeMap<String, JobOutcome> = BTreeMap::new();
        let mut first_error = None;

        for stage in &plan.stages {
            for run in &stage.runs {
                if cancel.is_cancelled() {
                    return Err(RunnerError::Cancelled.into());
                }
                let outcome = match self.run_job(run, &outcomes, cancel.clone()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(target: "job", "Job '{}' failed: {:#}", run.job_id, e);
                        first_error.get_or_insert(e);
                        JobOutcome {
                            result: JobResult::Failure,
                            outputs: HashMap::new(),
                        }
                    }
                };
                outcomes.insert(run.job_id.clone(), outcome);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    async fn run_job(
        &self,
        run: &Run,
        outcomes: &BTreeMap<String, JobOutcome>,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        let job = run.job();
        let needs: Map<String, Value> = job
            .needs
            .iter()
            .filter_map(|id| outcomes.get(id).map(|o| (id.clone(), o.to_value())))
            .collect();

        let blocked = job
            .needs
            .iter()
            .any(|id| outcomes.get(id).is_some_and(|o| o.result != JobResult::Success));
        if blocked && job.condition.is_none() {
            tracing::info!(target: "job", "Skipping job '{}' because a needed job did not succeed", run.job_id);
            return Ok(JobOutcome {
                result: JobResult::Skipped,
                outputs: HashMap::new(),
            });
        }

        let rc = self.new_run_context(run, needs)?;
        if !rc.is_enabled()? {
            return Ok(JobOutcome {
                result: JobResult::Skipped,
                outputs: HashMap::new(),
            });
        }
        rc.executor().run(cancel).await?;
        Ok(JobOutcome {
            result: JobResult::Success,
            outputs: rc.job_outputs(),
        })
    }

    fn new_run_context(&self, run: &Run, needs: Map<String, Value>) -> Result<Arc<RunContext>> {
        let (stack, inputs, masks) = match &self.caller {
            None => (CallStack::root(&run.job_id), Map::new(), None),
            Some(caller) => {
                let uses = caller.run.job().uses.clone().unwrap_or_default();
                let stack = caller.stack.push(Frame::ReusableWorkflow {
                    caller_job: caller.run.job_id.clone(),
                    uses,
                })?;
                (stack, workflow_call_inputs(caller, run), Some(caller.masks.clone()))
            }
        };
        Ok(RunContext::new(NewRunContext {
            config: self.config.clone(),
            run: run.clone(),
            services: self.services.clone(),
            event_json: self.event_json.clone(),
            matrix: Map::new(),
            inputs,
            needs,
            stack,
            masks,
        }))
    }
}

/// `inputs` of a called workflow: its declared defaults, overridden by the
/// caller's interpolated `with` values.
fn workflow_call_inputs(caller: &RunContext, run: &Run) -> Map<String, Value> {
    let ctx = caller.expression_context();
    let mut inputs = run.workflow.workflow_call_input_defaults();
    inputs.extend(caller.evaluator().interpolate_map(&ctx, &caller.run.job().with));
    inputs
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect()
}

/// The executor of a job that calls a reusable workflow.
pub fn reusable_workflow_executor(rc: Arc<RunContext>) -> Operation {
    Operation::new(move |cancel| {
        let rc = rc.clone();
        async move { run_reusable_workflow(rc, cancel).await }
    })
}

async fn run_reusable_workflow(rc: Arc<RunContext>, cancel: CancellationToken) -> Result<()> {
    let uses = rc.run.job().uses.clone().unwrap_or_default();
    let path = match WorkflowSource::parse(&uses)? {
        WorkflowSource::Local(path) => rc.config.workdir.join(path),
        WorkflowSource::Remote(reference) => {
            // Reusable workflows are fetched with the job token: they live on
            // the instance that triggered the run.
            let dir = rc
                .services
                .cache
                .ensure(
                    &uses,
                    &reference.clone_url(&rc.config.github_instance),
                    &reference.reference,
                    &rc.config.token,
                    cancel.clone(),
                )
                .await?;
            dir.join(reference.file_path())
        }
    };

    tracing::info!(target: "job", "🔁  Calling reusable workflow {} from {}", uses, rc);
    let plan = rc
        .services
        .planner
        .plan_event(&path, "workflow_call")
        .with_context(|| format!("failed to plan reusable workflow {uses}"))?;
    let Some(workflow) = plan.runs().next().map(|r| r.workflow.clone()) else {
        return Ok(());
    };

    let outcomes = Runner::for_caller(&rc).run(&plan, cancel).await?;

    let jobs: Map<String, Value> = outcomes
        .iter()
        .map(|(id, outcome)| (id.clone(), outcome.to_value()))
        .collect();
    let ctx = rc.expression_context().with("jobs", Value::Object(jobs));
    let outputs = rc
        .evaluator()
        .interpolate_map(&ctx, &workflow.workflow_call_outputs());
    rc.set_job_outputs(outputs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::runner_error;
    use crate::model::Workflow;
    use crate::planner::plan_jobs;
    use crate::test_support::{
        container_config, job_workflow, services_with, CountingFetcher, FetchOutcome, RecordingDriver,
    };
    use std::collections::BTreeSet;
    use std::path::Path;

    const LIBRARY: &str = r#"
name: lib
on:
  workflow_call:
    inputs:
      target:
        default: dev
    outputs:
      artifact:
        value: ${{ jobs.pack.outputs.name }}
jobs:
  pack:
    runs-on: ubuntu-latest
    outputs:
      name: ${{ inputs.target }}-pkg
    steps:
      - run: echo packing
"#;

    fn full_plan(workflow: Arc<Workflow>) -> Plan {
        let ids: BTreeSet<String> = workflow.jobs.keys().cloned().collect();
        plan_jobs(workflow, &ids).unwrap()
    }

    fn runner(config: Config, fetcher: CountingFetcher) -> (Runner, Arc<RecordingDriver>, Arc<CountingFetcher>) {
        let driver = RecordingDriver::new();
        let fetcher = Arc::new(fetcher);
        let services = services_with(driver.clone(), &config, fetcher.clone());
        let runner = Runner::new(Arc::new(config), services).unwrap();
        (runner, driver, fetcher)
    }

    #[tokio::test]
    async fn test_needs_outputs_flow_between_jobs() {
        let (workflow, _) = job_workflow(
            r#"
name: ci
jobs:
  build:
    runs-on: ubuntu-latest
    outputs:
      version: ${{ steps.meta.outputs.version }}
    steps:
      - id: meta
        run: echo meta
  deploy:
    runs-on: ubuntu-latest
    needs: build
    steps:
      - id: ship
        run: ship ${{ needs.build.outputs.version }}
"#,
        );
        let (runner, driver, _) = runner(container_config(Path::new("/src")), CountingFetcher::new(FetchOutcome::Ok));
        driver.on_exec(crate::test_support::ExecAction {
            matches: "meta.sh".into(),
            append: vec![("GITHUB_OUTPUT".into(), "version=3.1\n".into())],
            ..Default::default()
        });

        let outcomes = runner.run(&full_plan(workflow), CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes["build"].result, JobResult::Success);
        assert_eq!(outcomes["build"].outputs["version"], "3.1");
        assert_eq!(driver.file("/var/run/act/workflow/ship.sh").as_deref(), Some("ship 3.1"));
    }

    #[tokio::test]
    async fn test_failed_need_skips_dependent_job() {
        let (workflow, _) = job_workflow(
            "name: ci\njobs:\n  build:\n    runs-on: ubuntu-latest\n    steps:\n      - id: compile\n        run: make\n  deploy:\n    runs-on: ubuntu-latest\n    needs: [build]\n    steps:\n      - id: ship\n        run: ship\n",
        );
        let (runner, driver, _) = runner(container_config(Path::new("/src")), CountingFetcher::new(FetchOutcome::Ok));
        driver.on_exec(crate::test_support::ExecAction {
            matches: "compile.sh".into(),
            fail: true,
            ..Default::default()
        });

        assert!(runner.run(&full_plan(workflow), CancellationToken::new()).await.is_err());
        assert!(driver.execs().iter().all(|e| !e.command.join(" ").contains("ship.sh")));
    }

    #[tokio::test]
    async fn test_local_reusable_workflow() {
        let workdir = tempfile::tempdir().unwrap();
        let workflows = workdir.path().join(".github/workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("lib.yml"), LIBRARY).unwrap();

        let (workflow, _) = job_workflow(
            "name: ci\njobs:\n  caller:\n    uses: ./.github/workflows/lib.yml\n    with:\n      target: prod\n",
        );
        let (runner, driver, fetcher) = runner(container_config(workdir.path()), CountingFetcher::new(FetchOutcome::Ok));

        let outcomes = runner.run(&full_plan(workflow), CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes["caller"].outputs["artifact"], "prod-pkg");
        assert_eq!(fetcher.calls(), 0);
        assert!(driver.input("act_WORKFLOW-lib_JOB-caller-pack").is_some());
    }

    #[tokio::test]
    async fn test_remote_reusable_workflow_is_fetched_with_token() {
        let cache = tempfile::tempdir().unwrap();
        let mut config = container_config(Path::new("/src"));
        config.action_cache_dir = Some(cache.path().to_path_buf());
        config.token = "job-token".into();
        let (workflow, _) = job_workflow(
            "name: ci\njobs:\n  caller:\n    uses: octo/lib/.github/workflows/lib.yml@v1\n",
        );
        let (runner, _, fetcher) = runner(
            config,
            CountingFetcher::new(FetchOutcome::Ok).with_file(".github/workflows/lib.yml", LIBRARY),
        );

        let outcomes = runner.run(&full_plan(workflow), CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes["caller"].outputs["artifact"], "dev-pkg");
        let requests = fetcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://github.com/octo/lib");
        assert_eq!(requests[0].reference, "v1");
        assert_eq!(requests[0].token, "job-token");
    }

    #[tokio::test]
    async fn test_malformed_workflow_reference() {
        let (workflow, _) = job_workflow("name: ci\njobs:\n  caller:\n    uses: octo/lib@v1\n");
        let (runner, _, fetcher) = runner(container_config(Path::new("/src")), CountingFetcher::new(FetchOutcome::Ok));

        let err = runner.run(&full_plan(workflow), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            runner_error(&err),
            Some(RunnerError::MalformedWorkflowReference { .. })
        ));
        assert_eq!(fetcher.calls(), 0);
    }
}
