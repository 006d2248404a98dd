// Step and job status values as exposed to expressions (`steps.<id>.outcome`, `job.status`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a step stage or a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Merge a newly observed status into an accumulated one, keeping the worse.
    ///
    /// `Cancelled` sticks once reached; `Failure` replaces `Success`; `Skipped`
    /// never downgrades an accumulated status.
    pub fn merge(current: Option<StepStatus>, coming: StepStatus) -> StepStatus {
        match (current, coming) {
            (None, coming) => coming,
            (Some(StepStatus::Cancelled), _) => StepStatus::Cancelled,
            (Some(_), StepStatus::Cancelled) => StepStatus::Cancelled,
            (Some(StepStatus::Failure), _) => StepStatus::Failure,
            (Some(_), StepStatus::Failure) => StepStatus::Failure,
            (Some(current), StepStatus::Skipped) => current,
            (Some(_), StepStatus::Success) => StepStatus::Success,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
