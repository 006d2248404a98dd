// `run:` steps: the script is written into the environment and executed
// through the step's shell.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use act_common::process_invoker::split_args;

use crate::commands::line_handler;
use crate::container::{ExecRequest, FileEntry};
use crate::model::Step;
use crate::reference::safe_filename;
use crate::run_context::RunContext;

use super::{Stage, StepHandler};

pub struct RunStep {
    rc: Arc<RunContext>,
    step: Step,
}

/// Command template and script extension of a shell. `{0}` is the script path.
fn shell_command(shell: &str) -> (String, &'static str) {
    match shell {
        "" => ("bash -e {0}".to_string(), "sh"),
        "bash" => ("bash --noprofile --norc -e -o pipefail {0}".to_string(), "sh"),
        "sh" => ("sh -e {0}".to_string(), "sh"),
        "pwsh" => ("pwsh -command . '{0}'".to_string(), "ps1"),
        "powershell" => ("powershell -command . '{0}'".to_string(), "ps1"),
        "python" => ("python {0}".to_string(), "py"),
        custom if custom.contains("{0}") => (custom.to_string(), "sh"),
        custom => (format!("{custom} {{0}}"), "sh"),
    }
}

impl RunStep {
    pub fn new(rc: Arc<RunContext>, step: Step) -> Self {
        Self { rc, step }
    }

    /// Step shell, then job defaults, then workflow defaults.
    fn shell(&self) -> String {
        let job = self.rc.run.job();
        let shell = self
            .step
            .shell
            .clone()
            .or_else(|| job.defaults.run.shell.clone())
            .or_else(|| self.rc.run.workflow.defaults.run.shell.clone())
            .unwrap_or_default();
        self.rc.interpolate(&shell)
    }

    /// Working directory inside the environment; relative values resolve
    /// against the workspace.
    fn working_directory(&self) -> String {
        let job = self.rc.run.job();
        let configured = self
            .step
            .working_directory
            .clone()
            .or_else(|| job.defaults.run.working_directory.clone())
            .or_else(|| self.rc.run.workflow.defaults.run.working_directory.clone())
            .map(|dir| self.rc.interpolate(&dir))
            .unwrap_or_default();
        let workspace = self.rc.container_workdir();
        if configured.is_empty() {
            workspace
        } else if Path::new(&configured).is_absolute() {
            configured
        } else {
            format!("{}/{}", workspace.trim_end_matches('/'), configured)
        }
    }
}

#[async_trait]
impl StepHandler for RunStep {
    fn step(&self) -> &Step {
        &self.step
    }

    async fn execute(&self, _stage: Stage, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()> {
        let container = self
            .rc
            .job_container()
            .ok_or_else(|| anyhow::anyhow!("job environment is not running"))?;

        let script = self.rc.interpolate(self.step.run.as_deref().unwrap_or_default());
        let (template, extension) = shell_command(&self.shell());
        let script_name = format!("workflow/{}.{}", safe_filename(&self.step.id), extension);
        let script_path = format!("{}/{}", container.act_path(), script_name);
        tracing::debug!(target: "step", "Wrote command \n{}\n to '{}'", script, script_name);

        container
            .copy(&container.act_path(), vec![FileEntry::new(script_name, 0o755, script)], cancel.clone())
            .await?;

        let command = split_args(&template)
            .into_iter()
            .map(|arg| arg.replace("{0}", &script_path))
            .collect();
        container
            .exec(
                ExecRequest {
                    command,
                    env,
                    user: String::new(),
                    workdir: self.working_directory(),
                    on_line: Some(line_handler(&self.rc)),
                },
                cancel,
            )
            .await
    }
}
