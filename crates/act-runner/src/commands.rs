// Line handler for step and container output: applies workflow commands
// (`::set-output::`, `::add-mask::`, ...) and logs everything else masked.

use std::sync::{Arc, Weak};

use act_common::{LineHandler, WorkflowCommand};

use crate::run_context::RunContext;

/// Build the output handler for `rc`.
///
/// The handler holds a weak reference so that containers stored inside the
/// run context do not keep it alive.
pub fn line_handler(rc: &Arc<RunContext>) -> LineHandler {
    let weak: Weak<RunContext> = Arc::downgrade(rc);
    let log_output = rc.config.log_output;
    Arc::new(move |line: &str| {
        let Some(rc) = weak.upgrade() else {
            return;
        };
        handle_line(&rc, line, log_output);
    })
}

pub(crate) fn handle_line(rc: &RunContext, line: &str, log_output: bool) {
    let Some(command) = WorkflowCommand::parse(line) else {
        let masked = rc.masks.mask(line);
        if log_output {
            tracing::info!(target: "step", "  | {}", masked);
        } else {
            tracing::debug!(target: "step", "  | {}", masked);
        }
        return;
    };

    let step = rc.current_step();
    match command {
        WorkflowCommand::SetOutput { name, value } => {
            tracing::info!(target: "step", "  ⚙  ::set-output:: {}={}", name, rc.masks.mask(&value));
            rc.set_output(&step, &name, &value);
        }
        WorkflowCommand::SaveState { name, value } => {
            tracing::debug!(target: "step", "  💾  ::save-state:: {}", name);
            rc.save_state(&step, &name, &value);
        }
        WorkflowCommand::AddMask(value) => {
            rc.masks.add(&value);
            tracing::info!(target: "step", "  ⚙  ::add-mask:: ***");
        }
        WorkflowCommand::AddPath(path) => {
            tracing::info!(target: "step", "  ⚙  ::add-path:: {}", path);
            rc.add_path(&path);
        }
        WorkflowCommand::Debug(message) => {
            tracing::debug!(target: "step", "  💬  {}", rc.masks.mask(&message));
        }
        WorkflowCommand::Notice(message) => {
            tracing::info!(target: "step", "  ❗  {}", rc.masks.mask(&message));
        }
        WorkflowCommand::Warning(message) => {
            tracing::warn!(target: "step", "  ⚠  {}", rc.masks.mask(&message));
        }
        WorkflowCommand::Error(message) => {
            tracing::error!(target: "step", "  ❌  {}", rc.masks.mask(&message));
        }
        WorkflowCommand::Group(title) => {
            tracing::info!(target: "step", "  ❓ {}", rc.masks.mask(&title));
        }
        WorkflowCommand::EndGroup => {
            tracing::info!(target: "step", "  ❓ endgroup");
        }
    }
}
