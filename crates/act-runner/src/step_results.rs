// Step results tracked per run context.
// Backs the `steps.*` expression context and the job status.

use serde::Serialize;
use std::collections::HashMap;

use act_common::StepStatus;

/// Recorded result for a single step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    /// Outcome before `continue-on-error` adjustment.
    pub outcome: StepStatus,

    /// Conclusion after `continue-on-error` adjustment.
    pub conclusion: StepStatus,

    pub outputs: HashMap<String, String>,
}

impl Default for StepResult {
    fn default() -> Self {
        Self {
            outcome: StepStatus::Success,
            conclusion: StepStatus::Success,
            outputs: HashMap::new(),
        }
    }
}

/// Results of the steps run by one run context, keyed by step id.
#[derive(Debug, Clone, Default)]
pub struct StepResults {
    results: HashMap<String, StepResult>,
}

impl StepResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a step about to run, keeping an existing one
    /// (stages after `pre` reuse the result the first stage created).
    pub fn ensure(&mut self, step_id: &str) -> &mut StepResult {
        self.results.entry(step_id.to_string()).or_default()
    }

    /// Record how a step stage ended.
    ///
    /// A failed step with `continue-on-error` keeps `failure` as outcome but
    /// concludes `success`.
    pub fn record(&mut self, step_id: &str, outcome: StepStatus, continue_on_error: bool) {
        let result = self.ensure(step_id);
        result.outcome = outcome;
        result.conclusion = if outcome == StepStatus::Failure && continue_on_error {
            StepStatus::Success
        } else {
            outcome
        };
    }

    pub fn set_output(&mut self, step_id: &str, name: &str, value: &str) {
        self.ensure(step_id)
            .outputs
            .insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn output(&self, step_id: &str, name: &str) -> Option<&str> {
        self.results
            .get(step_id)
            .and_then(|r| r.outputs.get(name))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// `job.status`: failure once any step concluded failure.
    pub fn job_status(&self) -> StepStatus {
        if self
            .results
            .values()
            .any(|r| r.conclusion == StepStatus::Failure)
        {
            StepStatus::Failure
        } else {
            StepStatus::Success
        }
    }

    /// Convert to a serde_json::Value for expression evaluation.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.results).unwrap_or_else(|_| serde_json::json!({}))
    }
}
