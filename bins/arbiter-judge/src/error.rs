/// Pipeline Error Taxonomy
///
/// - Validation: caller mistakes, reported back before any work starts
/// - Infrastructure: containers, agents, artifacts, evaluator crashes; the
///   submission ends up `failed`
///
/// A wrong answer is not an error. It is a `failed` verdict and the pipeline
/// still finishes normally.

use crate::agent::AgentError;
use crate::evaluator::EvaluatorError;
use crate::launcher::RuntimeError;
use crate::problems::ProblemError;
use arbiter_common::types::{truncate_chars, TransitionError};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Test,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Build => f.write_str("build"),
            Stage::Test => f.write_str("test"),
        }
    }
}

/// Exit status and streams reported by an agent, already truncated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub exit_status: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(exit_status: i64, stdout: &str, stderr: &str, limit: usize) -> Self {
        Self {
            exit_status: Some(exit_status),
            stdout: truncate_chars(stdout, limit),
            stderr: truncate_chars(stderr, limit),
        }
    }
}

/// Why an agent reply that did arrive still cannot be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("the process exited with status {0}")]
    ExitStatus(i64),

    #[error("the results do not contain an entry for '{0}'")]
    MissingArtifact(String),

    #[error("no data was produced for '{0}'")]
    EmptyArtifact(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to load a problem definition for the ID '{problem_id}': {source}")]
    ProblemLookup {
        problem_id: String,
        #[source]
        source: ProblemError,
    },

    #[error("problem '{problem_id}' is incomplete: {message}")]
    ProblemIncomplete { problem_id: String, message: String },

    #[error("failed to run the {stage} container '{image}': {source}")]
    Container {
        stage: Stage,
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to extract host and port of the {stage} container '{image}' (agent port {port}): {detail}")]
    PortBinding {
        stage: Stage,
        image: String,
        port: u16,
        detail: String,
    },

    #[error("failed to communicate with the {stage} container '{image}': {source}")]
    AgentUnreachable {
        stage: Stage,
        image: String,
        #[source]
        source: AgentError,
    },

    #[error("the {stage} container '{image}' rejected the submission: {reason}")]
    AgentRejected {
        stage: Stage,
        image: String,
        reason: RejectReason,
        captured: CapturedOutput,
    },

    #[error("'{file}' from the {stage} container '{image}' is not valid base64: {detail}")]
    MalformedArtifact {
        stage: Stage,
        image: String,
        file: String,
        detail: String,
    },

    #[error("failed to run the evaluator for test {test_number}: {source}")]
    Evaluator {
        test_number: usize,
        #[source]
        source: EvaluatorError,
    },

    #[error("submission bookkeeping failed: {0}")]
    State(#[from] TransitionError),
}

impl PipelineError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::Validation(_))
    }

    /// Message safe to hand back to whoever submitted
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Validation(message) => message.clone(),
            PipelineError::ProblemLookup { .. } => {
                "No problem definitions were found for the provided ID.".to_string()
            }
            _ => "The test system has failed.".to_string(),
        }
    }

    pub fn captured(&self) -> Option<&CapturedOutput> {
        match self {
            PipelineError::AgentRejected { captured, .. } => Some(captured),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        let validation = PipelineError::Validation("The problem ID was not provided.".into());
        assert!(validation.is_client_error());
        assert_eq!(validation.client_message(), "The problem ID was not provided.");

        let incomplete = PipelineError::ProblemIncomplete {
            problem_id: "p".into(),
            message: "no tests".into(),
        };
        assert!(!incomplete.is_client_error());
        assert_eq!(incomplete.client_message(), "The test system has failed.");
    }

    #[test]
    fn test_rejection_carries_truncated_streams() {
        let err = PipelineError::AgentRejected {
            stage: Stage::Build,
            image: "judge/gcc".into(),
            reason: RejectReason::ExitStatus(1),
            captured: CapturedOutput::new(1, &"e".repeat(1500), "", 1000),
        };

        let captured = err.captured().unwrap();
        assert_eq!(captured.stdout.len(), 1000);
        assert_eq!(captured.exit_status, Some(1));
        assert_eq!(
            err.to_string(),
            "the build container 'judge/gcc' rejected the submission: the process exited with status 1"
        );
    }
}
