// Step kinds and the per-step stage machine.
//
// Every step is wrapped in a `StepHandler` for its kind; `StepMachine` drives
// the handler through the pre, main and post stages.

mod action_step;
mod composite;
mod docker_step;
mod run_step;
mod stage;

pub use action_step::ActionStep;
pub use docker_step::DockerStep;
pub use run_step::RunStep;
pub use stage::{StageState, StepMachine};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::github_context::GitHubContext;
use crate::model::{Step, StepKind};
use crate::run_context::RunContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pre,
    Main,
    Post,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Pre => "Pre",
            Stage::Main => "Main",
            Stage::Post => "Post",
        })
    }
}

/// Kind-specific behaviour of one step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step(&self) -> &Step;

    /// Resolve whatever the stage conditions depend on (an action's manifest).
    /// Called before every stage; must be cheap once resolved.
    async fn prepare(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Whether the step has anything to do in `stage`.
    fn has_stage(&self, stage: Stage) -> bool {
        stage == Stage::Main
    }

    /// The condition guarding `stage`.
    fn condition(&self, stage: Stage) -> String {
        match stage {
            Stage::Main => self.step().condition().to_string(),
            Stage::Pre | Stage::Post => "always()".to_string(),
        }
    }

    /// Extra env of the stage on top of the step's own env.
    fn stage_env(&self, _stage: Stage) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Whether the stage machine provisions and reads back the file-command
    /// files. Composite actions leave that to their inner steps.
    fn file_commands(&self) -> bool {
        true
    }

    /// Adjust the `github` context seen by the stage.
    fn github_overrides(&self, _ghc: &mut GitHubContext) {}

    async fn execute(&self, stage: Stage, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()>;
}

/// Build the handler for `step`, assigning a positional id when it has none.
pub fn new_step(rc: &Arc<RunContext>, index: usize, step: &Step) -> Result<Arc<dyn StepHandler>> {
    let mut step = step.clone();
    if step.id.is_empty() {
        step.id = index.to_string();
    }
    let handler: Arc<dyn StepHandler> = match step.kind() {
        StepKind::Run => Arc::new(RunStep::new(rc.clone(), step)),
        StepKind::Docker => Arc::new(DockerStep::new(rc.clone(), step)),
        StepKind::RemoteAction => Arc::new(ActionStep::remote(rc.clone(), step)),
        StepKind::LocalAction => Arc::new(ActionStep::local(rc.clone(), step)),
        StepKind::Invalid => {
            let reason = if step.run.is_some() && step.uses.is_some() {
                "a step cannot have both `uses` and `run` keys"
            } else {
                "a step must have either a `uses` or a `run` key"
            };
            return Err(RunnerError::InvalidStep {
                step: step.display_name(),
                reason: reason.to_string(),
            }
            .into());
        }
    };
    Ok(handler)
}

/// One state machine per step of `steps`, in order.
pub fn machines(rc: &Arc<RunContext>, steps: &[Step]) -> Result<Vec<Arc<StepMachine>>> {
    steps
        .iter()
        .enumerate()
        .map(|(index, step)| Ok(Arc::new(StepMachine::new(rc.clone(), new_step(rc, index, step)?))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simple_context;

    #[test]
    fn test_invalid_step_is_rejected() {
        let rc = simple_context("jobs:\n  build:\n    runs-on: x\n    steps: []\n");
        let step = Step {
            run: Some("echo".into()),
            uses: Some("actions/checkout@v4".into()),
            ..Step::default()
        };
        let err = new_step(&rc, 0, &step).err().unwrap();
        assert!(matches!(
            crate::error::runner_error(&err),
            Some(RunnerError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_positional_ids() {
        let rc = simple_context("jobs:\n  build:\n    runs-on: x\n    steps: []\n");
        let steps = vec![
            Step { run: Some("a".into()), ..Step::default() },
            Step { id: "named".into(), run: Some("b".into()), ..Step::default() },
        ];
        let machines = machines(&rc, &steps).unwrap();
        assert_eq!(machines[0].step_id(), "0");
        assert_eq!(machines[1].step_id(), "named");
    }
}
