// Orders the jobs of a workflow file into stages by their `needs`.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::model::{Run, Workflow};

/// Runs whose dependencies are all in earlier stages.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    pub runs: Vec<Run>,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub stages: Vec<Stage>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(|s| s.runs.is_empty())
    }

    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.stages.iter().flat_map(|s| s.runs.iter())
    }
}

pub trait WorkflowPlanner: Send + Sync {
    /// Plan every job of the workflow at `path` triggered by `event`.
    /// A workflow that does not listen to `event` yields an empty plan.
    fn plan_event(&self, path: &Path, event: &str) -> Result<Plan>;

    /// Plan one job together with the jobs it transitively needs.
    fn plan_job(&self, path: &Path, job_id: &str) -> Result<Plan>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlWorkflowPlanner;

impl YamlWorkflowPlanner {
    pub fn load(path: &Path) -> Result<Workflow> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow {}", path.display()))?;
        let mut workflow: Workflow = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse workflow {}", path.display()))?;
        if workflow.name.is_empty() {
            workflow.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
        }
        Ok(workflow)
    }
}

impl WorkflowPlanner for YamlWorkflowPlanner {
    fn plan_event(&self, path: &Path, event: &str) -> Result<Plan> {
        let workflow = Self::load(path)?;
        if !workflow.events().iter().any(|e| e == event) {
            tracing::debug!(target: "job", "Workflow '{}' is not triggered by '{}'", workflow.name, event);
            return Ok(Plan::default());
        }
        let job_ids: BTreeSet<String> = workflow.jobs.keys().cloned().collect();
        plan_jobs(Arc::new(workflow), &job_ids)
    }

    fn plan_job(&self, path: &Path, job_id: &str) -> Result<Plan> {
        let workflow = Self::load(path)?;
        if !workflow.jobs.contains_key(job_id) {
            bail!("job '{}' not found in {}", job_id, path.display());
        }
        let mut selected = BTreeSet::new();
        let mut pending = vec![job_id.to_string()];
        while let Some(id) = pending.pop() {
            if !selected.insert(id.clone()) {
                continue;
            }
            if let Some(job) = workflow.jobs.get(&id) {
                pending.extend(job.needs.iter().cloned());
            }
        }
        plan_jobs(Arc::new(workflow), &selected)
    }
}

/// Layer `job_ids` so each job lands in the stage after its last dependency.
pub fn plan_jobs(workflow: Arc<Workflow>, job_ids: &BTreeSet<String>) -> Result<Plan> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for id in job_ids {
        let Some(job) = workflow.jobs.get(id) else {
            bail!("job '{}' not found in workflow '{}'", id, workflow.name);
        };
        let mut needs = BTreeSet::new();
        for need in &job.needs {
            if !workflow.jobs.contains_key(need) {
                bail!("job '{}' needs unknown job '{}'", id, need);
            }
            needs.insert(need.as_str());
        }
        remaining.insert(id.as_str(), needs);
    }

    let mut plan = Plan::default();
    let mut done: BTreeSet<&str> = BTreeSet::new();
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, needs)| needs.iter().all(|n| done.contains(n)))
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            let blocked: Vec<&str> = remaining.keys().copied().collect();
            bail!("circular job dependencies between: {}", blocked.join(", "));
        }
        let mut stage = Stage::default();
        for id in ready {
            remaining.remove(id);
            done.insert(id);
            stage.runs.push(Run::new(workflow.clone(), id));
        }
        plan.stages.push(stage);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
on: [push, workflow_call]
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: make
  test:
    needs: build
    runs-on: ubuntu-latest
    steps:
      - run: make test
  lint:
    runs-on: ubuntu-latest
    steps:
      - run: make lint
  deploy:
    needs: [test, lint]
    runs-on: ubuntu-latest
    steps:
      - run: make deploy
"#;

    fn write_workflow(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ci.yml"), content).unwrap();
        dir
    }

    fn stage_ids(plan: &Plan) -> Vec<Vec<String>> {
        plan.stages
            .iter()
            .map(|s| s.runs.iter().map(|r| r.job_id.clone()).collect())
            .collect()
    }

    #[test]
    fn test_plan_event_orders_by_needs() {
        let dir = write_workflow(WORKFLOW);
        let plan = YamlWorkflowPlanner.plan_event(&dir.path().join("ci.yml"), "push").unwrap();
        assert_eq!(
            stage_ids(&plan),
            vec![vec!["build", "lint"], vec!["test"], vec!["deploy"]]
        );
        assert_eq!(plan.runs().next().unwrap().workflow.name, "ci");
    }

    #[test]
    fn test_plan_event_ignores_other_events() {
        let dir = write_workflow(WORKFLOW);
        let plan = YamlWorkflowPlanner
            .plan_event(&dir.path().join("ci.yml"), "pull_request")
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_job_includes_dependencies() {
        let dir = write_workflow(WORKFLOW);
        let plan = YamlWorkflowPlanner.plan_job(&dir.path().join("ci.yml"), "test").unwrap();
        assert_eq!(stage_ids(&plan), vec![vec!["build"], vec!["test"]]);
    }

    #[test]
    fn test_cycles_and_unknown_needs_fail() {
        let cyclic = write_workflow(
            "on: push\njobs:\n  a:\n    needs: b\n    steps: []\n  b:\n    needs: a\n    steps: []\n",
        );
        assert!(YamlWorkflowPlanner.plan_event(&cyclic.path().join("ci.yml"), "push").is_err());

        let unknown = write_workflow("on: push\njobs:\n  a:\n    needs: ghost\n    steps: []\n");
        assert!(YamlWorkflowPlanner.plan_event(&unknown.path().join("ci.yml"), "push").is_err());
    }
}
