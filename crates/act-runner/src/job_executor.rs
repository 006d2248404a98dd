// Executor of a regular job: environment startup, the pre/main/post passes
// over the steps, and teardown.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::StepStatus;

use crate::error::{runner_error, RunnerError};
use crate::pipeline::Operation;
use crate::run_context::RunContext;
use crate::steps::{machines, StepMachine};

fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(runner_error(err), Some(e) if e.is_fatal_setup() || matches!(e, RunnerError::Cancelled))
}

/// Run one stage of every step in order. A failing step does not stop the
/// pass: later steps see the failure through their conditions. Fatal setup
/// errors and cancellation stop it immediately.
fn stage_pass(ops: Vec<Operation>) -> Operation {
    let ops = Arc::new(ops);
    Operation::new(move |cancel: CancellationToken| {
        let ops = ops.clone();
        async move {
            let mut first_error = None;
            for op in ops.iter() {
                if cancel.is_cancelled() {
                    return Err(first_error.unwrap_or_else(|| RunnerError::Cancelled.into()));
                }
                if let Err(e) = op.run(cancel.clone()).await {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        }
    })
}

/// The executor of a job whose steps run in this process.
pub fn job_executor(rc: Arc<RunContext>) -> Operation {
    Operation::new(move |cancel| {
        let rc = rc.clone();
        async move { run_job(rc, cancel).await }
    })
}

async fn run_job(rc: Arc<RunContext>, cancel: CancellationToken) -> Result<()> {
    let steps: Vec<Arc<StepMachine>> = machines(&rc, &rc.run.job().steps)?;
    tracing::info!(target: "job", "🚀  Start job {} image={}", rc, rc.platform_image());

    let pres = stage_pass(steps.iter().map(|m| m.pre()).collect());
    let mains = stage_pass(steps.iter().map(|m| m.main()).collect());
    let posts = stage_pass(steps.iter().rev().map(|m| m.post()).collect());

    let body = {
        let rc = rc.clone();
        Operation::new(move |cancel: CancellationToken| {
            let rc = rc.clone();
            let pres = pres.clone();
            let mains = mains.clone();
            async move {
                rc.start_container().run(cancel.clone()).await?;
                let pre = pres.run(cancel.clone()).await;
                if pre.as_ref().is_err_and(is_fatal) {
                    return pre;
                }
                let main = mains.run(cancel).await;
                pre.and(main)
            }
        })
    };

    let outputs = {
        let rc = rc.clone();
        Operation::new(move |_| {
            let rc = rc.clone();
            async move {
                rc.interpolate_outputs();
                Ok(())
            }
        })
    };
    let teardown = outputs
        .then(rc.stop_container())
        .finally(rc.close_container().log_errors("Failed to close job environment"));

    let result = body.finally(posts).finally(teardown).run(cancel).await;

    match (&result, rc.job_status()) {
        (Ok(()), StepStatus::Success) => tracing::info!(target: "job", "🏁  Job succeeded"),
        _ => tracing::error!(target: "job", "🏁  Job failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{container_config, context_with, ExecAction};
    use std::path::Path;

    const JOB: &str = r#"
name: ci
jobs:
  build:
    runs-on: ubuntu-latest
    outputs:
      version: ${{ steps.meta.outputs.version }}
    steps:
      - id: meta
        run: echo "version=2.0" >> "$GITHUB_OUTPUT"
      - id: test
        run: make test
      - id: report
        if: always()
        run: ./report.sh
"#;

    const JOB_CONTAINER: &str = "act_WORKFLOW-ci_JOB-build";

    #[tokio::test]
    async fn test_disabled_job_touches_nothing() {
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    if: false\n    steps:\n      - run: echo\n",
            container_config(Path::new("/src")),
        );
        rc.executor().run(CancellationToken::new()).await.unwrap();
        assert!(driver.ops().is_empty());
    }

    #[tokio::test]
    async fn test_job_runs_steps_and_tears_down() {
        let (rc, driver) = context_with(JOB, container_config(Path::new("/src")));
        driver.on_exec(ExecAction {
            matches: "meta.sh".into(),
            append: vec![("GITHUB_OUTPUT".into(), "version=2.0\n".into())],
            ..ExecAction::default()
        });

        rc.executor().run(CancellationToken::new()).await.unwrap();

        let results = rc.step_results();
        for id in ["meta", "test", "report"] {
            assert_eq!(results.get(id).unwrap().conclusion, StepStatus::Success, "{id}");
        }
        assert_eq!(rc.job_outputs()["version"], "2.0");

        let ops = driver.ops();
        let start = ops.iter().position(|op| *op == format!("start:{JOB_CONTAINER}")).unwrap();
        let first_exec = ops.iter().position(|op| op.starts_with("exec:")).unwrap();
        let removed = ops.iter().rposition(|op| *op == format!("remove:{JOB_CONTAINER}")).unwrap();
        assert!(start < first_exec);
        assert!(first_exec < removed);
        assert_eq!(driver.execs().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_step_fails_job_but_cleanup_runs() {
        let (rc, driver) = context_with(JOB, container_config(Path::new("/src")));
        driver.on_exec(ExecAction {
            matches: "meta.sh".into(),
            fail: true,
            ..ExecAction::default()
        });

        assert!(rc.executor().run(CancellationToken::new()).await.is_err());

        let results = rc.step_results();
        assert_eq!(results.get("meta").unwrap().conclusion, StepStatus::Failure);
        assert_eq!(results.get("test").unwrap().outcome, StepStatus::Skipped);
        assert_eq!(results.get("report").unwrap().outcome, StepStatus::Success);
        assert_eq!(rc.job_status(), StepStatus::Failure);
        assert!(driver.ops().contains(&format!("remove:{JOB_CONTAINER}")));
    }

    #[tokio::test]
    async fn test_invalid_step_fails_before_startup() {
        let (rc, driver) = context_with(
            "jobs:\n  build:\n    runs-on: ubuntu-latest\n    steps:\n      - name: nothing\n",
            container_config(Path::new("/src")),
        );
        let err = rc.executor().run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(runner_error(&err), Some(RunnerError::InvalidStep { .. })));
        assert!(driver.ops().is_empty());
    }

    #[tokio::test]
    async fn test_reused_containers_are_kept() {
        let mut config = container_config(Path::new("/src"));
        config.reuse_containers = true;
        let (rc, driver) = context_with(JOB, config);
        rc.executor().run(CancellationToken::new()).await.unwrap();
        assert!(!driver.ops().iter().any(|op| op.starts_with("remove:")));
    }
}
