// act-runner: the job execution engine.
//
// A `Runner` executes a plan of jobs. Each job gets a `RunContext`, which
// evaluates the job condition, provisions a container or host environment,
// drives every step through its pre, main and post stages and tears the
// environment down again.

pub mod action_manifest;
pub mod commands;
pub mod config;
pub mod container;
pub mod error;
pub mod expressions;
pub mod git_fetcher;
pub mod github_context;
pub mod job_executor;
pub mod model;
pub mod pipeline;
pub mod planner;
pub mod reference;
pub mod run_context;
pub mod runner;
pub mod source_cache;
pub mod step_results;
pub mod steps;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::RunnerError;
pub use pipeline::Operation;
pub use run_context::{RunContext, RunnerServices};
pub use runner::Runner;
