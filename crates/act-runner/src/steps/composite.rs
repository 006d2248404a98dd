// Composite actions: the action's own steps run as a nested job inside a
// child run context.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::action_manifest::ActionManifest;
use crate::error::{runner_error, RunnerError};
use crate::pipeline::Operation;
use crate::run_context::{MappableOutput, RunContext};

use super::{machines, Stage, StepMachine};

static STEP_OUTPUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$\{\{\s*steps\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\s*\}\}$")
        .expect("valid step output regex")
});

pub(super) struct CompositeRun {
    child: Arc<RunContext>,
    step_id: String,
    machines: Vec<Arc<StepMachine>>,
    /// Output name → value expression.
    outputs: HashMap<String, String>,
}

impl CompositeRun {
    pub(super) fn new(
        parent: &Arc<RunContext>,
        step_id: &str,
        uses: &str,
        action_path: &str,
        manifest: &ActionManifest,
        inputs: Map<String, Value>,
    ) -> Result<Self> {
        let steps = manifest.runs.steps.clone();
        let child = RunContext::composite_child(parent, step_id, uses, action_path, steps.clone(), inputs)?;

        let mut outputs = HashMap::new();
        for (name, output) in &manifest.outputs {
            let Some(value) = output.value.clone() else {
                continue;
            };
            // Plain step-output references are forwarded as soon as the inner
            // step writes them.
            if let Some(caps) = STEP_OUTPUT_RE.captures(value.trim()) {
                child.add_output_mapping(
                    MappableOutput {
                        step_id: caps[1].to_string(),
                        output_name: caps[2].to_string(),
                    },
                    MappableOutput {
                        step_id: step_id.to_string(),
                        output_name: name.clone(),
                    },
                );
            }
            outputs.insert(name.clone(), value);
        }

        let machines = machines(&child, &steps)?;
        Ok(Self {
            child,
            step_id: step_id.to_string(),
            machines,
            outputs,
        })
    }

    /// Run `stage` of every inner step. Posts run in reverse order. A failing
    /// inner step does not stop the remaining ones, which see the failure
    /// through `job.status`.
    ///
    /// `layer` and `inputs` are evaluated against the parent's current state
    /// and replace whatever the previous stage saw.
    pub(super) async fn run_stage(
        &self,
        stage: Stage,
        layer: HashMap<String, String>,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.child.refresh_env(layer, inputs);

        let ops: Vec<Operation> = match stage {
            Stage::Pre => self.machines.iter().map(|m| m.pre()).collect(),
            Stage::Main => self.machines.iter().map(|m| m.main()).collect(),
            Stage::Post => self.machines.iter().rev().map(|m| m.post()).collect(),
        };

        let mut first_error = None;
        for op in ops {
            if cancel.is_cancelled() {
                return Err(RunnerError::Cancelled.into());
            }
            if let Err(e) = op.run(cancel.clone()).await {
                if runner_error(&e).is_some_and(|e| e.is_fatal_setup()) {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        if stage == Stage::Main {
            self.publish_outputs();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn publish_outputs(&self) {
        let Some(parent) = self.child.parent() else {
            return;
        };
        let ctx = self.child.expression_context();
        for (name, expression) in &self.outputs {
            let value = self.child.evaluator().interpolate(&ctx, expression);
            parent.set_output(&self.step_id, name, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::steps::{ActionStep, StepMachine};
    use crate::test_support::{container_config, context_with, ExecAction};
    use act_common::StepStatus;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const COMPOSITE: &str = r#"
name: meta
inputs:
  flavor:
    default: plain
outputs:
  version:
    value: ${{ steps.inner.outputs.v }}
  flavor:
    value: ${{ inputs.flavor }}
runs:
  using: composite
  steps:
    - id: inner
      run: echo "v=1.0" >> "$GITHUB_OUTPUT"
      shell: bash
    - id: after
      run: echo done
      shell: bash
"#;

    fn workspace() -> tempfile::TempDir {
        let workdir = tempfile::tempdir().unwrap();
        let dir = workdir.path().join("meta");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("action.yml"), COMPOSITE).unwrap();
        workdir
    }

    fn step(with: &[(&str, &str)]) -> crate::model::Step {
        crate::model::Step {
            id: "meta".into(),
            uses: Some("./meta".into()),
            with: with.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..crate::model::Step::default()
        }
    }

    #[tokio::test]
    async fn test_composite_outputs_and_inputs() {
        let workdir = workspace();
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    steps: []\n",
            container_config(workdir.path()),
        );
        rc.start_container().run(CancellationToken::new()).await.unwrap();
        driver.on_exec(ExecAction {
            matches: "inner.sh".into(),
            append: vec![("GITHUB_OUTPUT".into(), "v=1.0\n".into())],
            ..ExecAction::default()
        });

        let handler = Arc::new(ActionStep::local(rc.clone(), step(&[("flavor", "spicy")])));
        let machine = Arc::new(StepMachine::new(rc.clone(), handler));
        machine.main().run(CancellationToken::new()).await.unwrap();

        let results = rc.step_results();
        assert_eq!(results.get("meta").unwrap().conclusion, StepStatus::Success);
        assert_eq!(results.output("meta", "version"), Some("1.0"));
        assert_eq!(results.output("meta", "flavor"), Some("spicy"));
        // Inner step results stay inside the composite.
        assert!(results.get("inner").is_none());

        let execs = driver.execs();
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].env["INPUT_FLAVOR"], "spicy");
    }

    #[tokio::test]
    async fn test_failing_inner_step_fails_the_action() {
        let workdir = workspace();
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    steps: []\n",
            container_config(workdir.path()),
        );
        rc.start_container().run(CancellationToken::new()).await.unwrap();
        driver.on_exec(ExecAction {
            matches: "inner.sh".into(),
            fail: true,
            ..ExecAction::default()
        });

        let handler = Arc::new(ActionStep::local(rc.clone(), step(&[])));
        let machine = Arc::new(StepMachine::new(rc.clone(), handler));
        assert!(machine.main().run(CancellationToken::new()).await.is_err());

        assert_eq!(rc.step_results().get("meta").unwrap().conclusion, StepStatus::Failure);
        // The second inner step is skipped by its implicit success() condition.
        assert_eq!(driver.execs().len(), 1);
    }

    #[tokio::test]
    async fn test_inputs_follow_sibling_outputs_written_after_pre() {
        let workdir = tempfile::tempdir().unwrap();
        let dir = workdir.path().join("taste");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("action.yml"),
            r#"
inputs:
  flavor:
    default: plain
outputs:
  flavor:
    value: ${{ inputs.flavor }}
runs:
  using: composite
  steps:
    - id: taste
      run: echo ${{ inputs.flavor }}
      shell: bash
"#,
        )
        .unwrap();
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    steps: []\n",
            container_config(workdir.path()),
        );
        rc.start_container().run(CancellationToken::new()).await.unwrap();

        let handler = Arc::new(ActionStep::local(
            rc.clone(),
            crate::model::Step {
                id: "meal".into(),
                uses: Some("./taste".into()),
                with: [("flavor".to_string(), "${{ steps.prev.outputs.x }}".to_string())].into(),
                ..crate::model::Step::default()
            },
        ));
        let machine = Arc::new(StepMachine::new(rc.clone(), handler));
        machine.pre().run(CancellationToken::new()).await.unwrap();

        rc.set_output("prev", "x", "spicy");
        machine.main().run(CancellationToken::new()).await.unwrap();

        assert_eq!(rc.step_results().output("meal", "flavor"), Some("spicy"));
        assert_eq!(driver.file("/var/run/act/workflow/taste.sh").as_deref(), Some("echo spicy"));
        assert_eq!(driver.execs().pop().unwrap().env["INPUT_FLAVOR"], "spicy");
    }
}
