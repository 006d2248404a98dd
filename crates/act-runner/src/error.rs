// Typed failures of the job execution engine.
//
// Everything travels as `anyhow::Error`; callers that need to tell failures
// apart use `err.downcast_ref::<RunnerError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// A step `uses:` value does not match `{org}/{repo}[/path]@ref`.
    #[error("Expected format {{org}}/{{repo}}[/path]@ref. Actual '{uses}' Input string was not in a correct format")]
    MalformedReference { uses: String },

    /// A job `uses:` value does not match the reusable-workflow grammar.
    #[error("expected format {{owner}}/{{repo}}/.{{git_platform}}/workflows/{{filename}}@{{ref}}. Actual '{uses}' Input string was not in a correct format")]
    MalformedWorkflowReference { uses: String },

    /// Registry credentials are incomplete after interpolation.
    #[error("{0}")]
    Credential(String),

    /// The ref of a remote action or workflow is an abbreviated commit SHA.
    #[error("Unable to resolve action `{uses}`, the provided ref `{reference}` is the shortened version of a commit SHA, which is not supported. Please use the full commit SHA `{full_sha}` instead")]
    ShortRef {
        uses: String,
        reference: String,
        full_sha: String,
    },

    /// A cached checkout could not be fast-forwarded; the stale tree is reused.
    #[error("Unable to pull {reference}: non-fast-forward update, reusing the cached copy")]
    ForceNeeded { reference: String },

    /// A condition expression could not be evaluated.
    #[error("Error in if-expression: \"if: {expression}\" ({message})")]
    Evaluation { expression: String, message: String },

    /// The container driver produced no container handle.
    #[error("Failed to create {0} container")]
    ContainerCreate(String),

    /// A step could not be classified into a runnable kind.
    #[error("invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl RunnerError {
    /// True for failures that must abort the enclosing step even when it is
    /// marked `continue-on-error`.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            RunnerError::MalformedReference { .. }
                | RunnerError::MalformedWorkflowReference { .. }
                | RunnerError::Credential(_)
                | RunnerError::ShortRef { .. }
        )
    }
}

/// Returns the typed runner error inside `err`, if any.
pub fn runner_error(err: &anyhow::Error) -> Option<&RunnerError> {
    err.chain().find_map(|cause| cause.downcast_ref::<RunnerError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_malformed_reference_message() {
        let err = RunnerError::MalformedReference {
            uses: "not-a-valid-ref".into(),
        };
        assert_eq!(
            err.to_string(),
            "Expected format {org}/{repo}[/path]@ref. Actual 'not-a-valid-ref' Input string was not in a correct format"
        );
    }

    #[test]
    fn test_short_ref_mentions_full_sha() {
        let err = RunnerError::ShortRef {
            uses: "actions/checkout@abc1234".into(),
            reference: "abc1234".into(),
            full_sha: "abc1234def5678".into(),
        };
        assert!(err.to_string().contains("`abc1234def5678`"));
    }

    #[test]
    fn test_runner_error_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(RunnerError::Credential("bad".into()))
            .context("starting service redis")
            .unwrap_err();
        assert!(matches!(runner_error(&err), Some(RunnerError::Credential(_))));
        assert!(runner_error(&err).unwrap().is_fatal_setup());
    }
}
