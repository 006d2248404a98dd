// The per-step stage machine: condition gating, file-command provisioning,
// timeouts, result recording and continue-on-error handling for each stage.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use act_common::constants::{state_files, variables};
use act_common::{parse_key_value_file, StepStatus};

use crate::container::{ExecutionEnvironment, FileEntry};
use crate::error::runner_error;
use crate::expressions::DefaultStatusCheck;
use crate::pipeline::Operation;
use crate::run_context::RunContext;

use super::{Stage, StepHandler};

/// Where a step is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotStarted,
    Pre,
    Main,
    Post,
    Done,
    Failed(Stage),
}

pub struct StepMachine {
    rc: Arc<RunContext>,
    handler: Arc<dyn StepHandler>,
    state: Mutex<StageState>,
    main_ran: Mutex<bool>,
}

/// Paths of the file-command files inside the environment, keyed by env var.
struct FileCommands {
    output: String,
    state: String,
    path: String,
    env: String,
    summary: String,
}

impl FileCommands {
    fn new(act_path: &str) -> Self {
        let at = |file: &str| format!("{act_path}/{file}");
        Self {
            output: at(state_files::OUTPUT),
            state: at(state_files::STATE),
            path: at(state_files::PATH),
            env: at(state_files::ENV),
            summary: at(state_files::STEP_SUMMARY),
        }
    }

    fn vars(&self) -> [(&'static str, &str); 5] {
        [
            (variables::GITHUB_OUTPUT, &self.output),
            (variables::GITHUB_STATE, &self.state),
            (variables::GITHUB_PATH, &self.path),
            (variables::GITHUB_ENV, &self.env),
            (variables::GITHUB_STEP_SUMMARY, &self.summary),
        ]
    }
}

impl StepMachine {
    pub fn new(rc: Arc<RunContext>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            rc,
            handler,
            state: Mutex::new(StageState::NotStarted),
            main_ran: Mutex::new(false),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.handler.step().id
    }

    pub fn state(&self) -> StageState {
        *self.state.lock()
    }

    pub fn pre(self: &Arc<Self>) -> Operation {
        self.stage_op(Stage::Pre)
    }

    pub fn main(self: &Arc<Self>) -> Operation {
        self.stage_op(Stage::Main)
    }

    /// Runs only when the main stage actually executed.
    pub fn post(self: &Arc<Self>) -> Operation {
        self.stage_op(Stage::Post)
    }

    fn stage_op(self: &Arc<Self>, stage: Stage) -> Operation {
        let machine = self.clone();
        Operation::new(move |cancel| {
            let machine = machine.clone();
            async move {
                let result = machine.run_stage(stage, cancel).await;
                let mut state = machine.state.lock();
                let previous = *state;
                *state = match (&result, stage) {
                    (Err(_), _) => StageState::Failed(stage),
                    (Ok(()), _) if matches!(previous, StageState::Failed(_)) => previous,
                    (Ok(()), Stage::Post) => StageState::Done,
                    (Ok(()), Stage::Pre) => StageState::Pre,
                    (Ok(()), Stage::Main) => StageState::Main,
                };
                drop(state);
                result
            }
        })
    }

    async fn run_stage(&self, stage: Stage, cancel: CancellationToken) -> Result<()> {
        let rc = &self.rc;
        let step = self.handler.step();
        rc.set_current_step(&step.id);

        if stage == Stage::Post && !*self.main_ran.lock() {
            return Ok(());
        }
        // The failed pre stage stays the step's recorded result.
        if stage == Stage::Main && self.state() == StageState::Failed(Stage::Pre) {
            tracing::debug!(target: "step", "Skipping main of '{}' after its pre stage failed", step.display_name());
            return Ok(());
        }

        if let Err(e) = self.handler.prepare(cancel.clone()).await {
            return self.fail(stage, e);
        }
        if !self.handler.has_stage(stage) {
            return Ok(());
        }
        if stage == Stage::Main {
            rc.ensure_step_result(&step.id);
        }

        let condition = self.handler.condition(stage);
        let mut ctx = rc.expression_context();
        ctx.cancelled = cancel.is_cancelled();
        let enabled = match rc.evaluator().eval_bool(&ctx, &condition, DefaultStatusCheck::Success) {
            Ok(enabled) => enabled,
            Err(e) => {
                rc.record_step(&step.id, StepStatus::Failure, false);
                return Err(e);
            }
        };
        if !enabled {
            tracing::debug!(target: "step", "Skipping step '{}' due to '{}'", step.display_name(), condition);
            if stage == Stage::Main {
                rc.record_step(&step.id, StepStatus::Skipped, false);
            }
            return Ok(());
        }

        let name = rc.interpolate(&step.display_name());
        tracing::info!(target: "step", "⭐ Run {} {}", stage, name);
        if stage == Stage::Main {
            *self.main_ran.lock() = true;
        }

        let container = rc
            .job_container()
            .ok_or_else(|| anyhow!("job environment is not running"))?;
        let files = FileCommands::new(&container.act_path());
        let file_commands = self.handler.file_commands();
        if file_commands {
            self.provision_file_commands(&container, cancel.clone()).await?;
        }

        let env = self.stage_env(stage, &files, cancel.clone()).await;
        let result = self.execute_with_timeout(stage, env, cancel.clone()).await;

        if file_commands {
            if let Err(e) = self.process_file_commands(stage, &container, &files, cancel).await {
                tracing::warn!(target: "step", "Failed to process file commands of '{}': {:#}", name, e);
            }
        }

        match result {
            Ok(()) => {
                if stage == Stage::Main {
                    rc.record_step(&step.id, StepStatus::Success, false);
                }
                tracing::info!(target: "step", "  ✅  Success - {} {}", stage, name);
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "step", "  ❌  Failure - {} {}", stage, name);
                self.fail(stage, e)
            }
        }
    }

    /// Record a failed stage. Fatal setup errors always propagate; other
    /// errors are absorbed when the step continues on error.
    fn fail(&self, stage: Stage, err: anyhow::Error) -> Result<()> {
        let step = self.handler.step();
        if runner_error(&err).is_some_and(|e| e.is_fatal_setup()) {
            self.rc.record_step(&step.id, StepStatus::Failure, false);
            return Err(err);
        }
        let continue_on_error = self.continue_on_error();
        self.rc.record_step(&step.id, StepStatus::Failure, continue_on_error);
        if continue_on_error {
            tracing::info!(target: "step", "Failed but continue next step: {} ({:#})", stage, err);
            return Ok(());
        }
        Err(err)
    }

    fn continue_on_error(&self) -> bool {
        let Some(expression) = self.handler.step().continue_on_error.as_deref() else {
            return false;
        };
        let ctx = self.rc.expression_context();
        match self.rc.evaluator().eval_bool(&ctx, expression, DefaultStatusCheck::None) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(target: "step", "Invalid continue-on-error '{}': {:#}", expression, e);
                false
            }
        }
    }

    async fn provision_file_commands(&self, container: &Arc<dyn ExecutionEnvironment>, cancel: CancellationToken) -> Result<()> {
        let empty = |name: &str| FileEntry::new(name, 0o666, "");
        container
            .copy(
                &container.act_path(),
                vec![
                    empty(state_files::OUTPUT),
                    empty(state_files::STATE),
                    empty(state_files::PATH),
                    empty(state_files::STEP_SUMMARY),
                ],
                cancel,
            )
            .await
    }

    async fn stage_env(&self, stage: Stage, files: &FileCommands, cancel: CancellationToken) -> HashMap<String, String> {
        let rc = &self.rc;
        let mut ghc = rc.github_context();
        self.handler.github_overrides(&mut ghc);

        let ctx = rc.expression_context();
        let mut step_env = rc.evaluator().interpolate_map(&ctx, &self.handler.step().env);
        step_env.extend(self.handler.stage_env(stage));

        let mut env = rc.step_env(step_env, &ghc, cancel).await;
        for (name, path) in files.vars() {
            env.insert(name.to_string(), path.to_string());
        }
        env
    }

    async fn execute_with_timeout(&self, stage: Stage, env: HashMap<String, String>, cancel: CancellationToken) -> Result<()> {
        let child = cancel.child_token();
        let execution = self.handler.execute(stage, env, child.clone());
        let Some(limit) = self.timeout() else {
            return execution.await;
        };
        match tokio::time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => {
                child.cancel();
                Err(anyhow!("step timed out after {:?}", limit))
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        let raw = self.handler.step().timeout_minutes.as_deref()?;
        let value = self.rc.interpolate(raw);
        let minutes: f64 = value.trim().parse().ok()?;
        if minutes <= 0.0 {
            return None;
        }
        match Duration::try_from_secs_f64(minutes * 60.0) {
            Ok(limit) => Some(limit),
            Err(_) => {
                tracing::warn!(target: "step", "Ignoring invalid timeout-minutes '{}'", value);
                None
            }
        }
    }

    /// Read the file-command files back into the run context.
    async fn process_file_commands(
        &self,
        stage: Stage,
        container: &Arc<dyn ExecutionEnvironment>,
        files: &FileCommands,
        cancel: CancellationToken,
    ) -> Result<()> {
        let rc = &self.rc;
        let step_id = &self.handler.step().id;

        if let Some(content) = container.read_file(&files.env, cancel.clone()).await? {
            for (name, value) in parse_key_value_file(&content)? {
                rc.set_env(&name, &value);
            }
        }
        if let Some(content) = container.read_file(&files.state, cancel.clone()).await? {
            for (name, value) in parse_key_value_file(&content)? {
                rc.save_state(step_id, &name, &value);
            }
        }
        if stage == Stage::Main {
            if let Some(content) = container.read_file(&files.output, cancel.clone()).await? {
                for (name, value) in parse_key_value_file(&content)? {
                    rc.set_output(step_id, &name, &value);
                }
            }
        }
        rc.update_extra_path(&files.path, cancel).await
    }
}
