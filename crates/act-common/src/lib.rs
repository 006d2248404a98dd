// act-common: shared building blocks for the act job runner.
// Depends on no other workspace crate; `act-runner` builds the execution engine on top of it.

pub mod constants;
pub mod file_command;
pub mod logging;
pub mod process_invoker;
pub mod secret_masker;
pub mod step_status;
pub mod workflow_command;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use file_command::{parse_key_value_file, parse_path_file};
pub use process_invoker::{ExecOutcome, LineHandler, ProcessExitCodeError, ProcessInvoker, ProcessRequest};
pub use secret_masker::SecretMasker;
pub use step_status::StepStatus;
pub use workflow_command::WorkflowCommand;
