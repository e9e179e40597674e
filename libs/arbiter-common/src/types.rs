use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a submission
///
/// Edges: `InProgress → Building → Testing → Finished`, `InProgress → Testing`
/// when nothing has to be built, and any non-terminal state `→ Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionStatus {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "building")]
    Building,
    #[serde(rename = "testing")]
    Testing,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "failed")]
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::InProgress => "in progress",
            SubmissionStatus::Building => "building",
            SubmissionStatus::Testing => "testing",
            SubmissionStatus::Finished => "finished",
            SubmissionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in progress" => Some(SubmissionStatus::InProgress),
            "building" => Some(SubmissionStatus::Building),
            "testing" => Some(SubmissionStatus::Testing),
            "finished" => Some(SubmissionStatus::Finished),
            "failed" => Some(SubmissionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Finished | SubmissionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        match (*self, next) {
            (InProgress, Building) | (InProgress, Testing) | (Building, Testing) => true,
            (Testing, Finished) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Testing,
    Passed,
    Failed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Testing => "testing",
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "testing" => Some(Verdict::Testing),
            "passed" => Some(Verdict::Passed),
            "failed" => Some(Verdict::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize verdicts as the comma-delimited list kept by the status store
pub fn encode_verdicts(verdicts: &[Verdict]) -> String {
    verdicts
        .iter()
        .map(Verdict::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`encode_verdicts`]; unknown tokens are dropped
pub fn decode_verdicts(encoded: &str) -> Vec<Verdict> {
    encoded
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(Verdict::parse)
        .collect()
}

/// Cut a captured stream down to at most `limit` characters
pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("submission cannot move from '{from}' to '{to}'")]
    Invalid {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("verdict list is already at its limit of {limit} tests")]
    TooManyVerdicts { limit: usize },

    #[error("no test is in progress")]
    NoTestInProgress,
}

/// One judged piece of source code and everything reported about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub problem_id: String,
    pub status: SubmissionStatus,
    pub results: Vec<Verdict>,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(problem_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            problem_id: problem_id.into(),
            status: SubmissionStatus::InProgress,
            results: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: SubmissionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a `testing` placeholder and return the 1-based test number
    pub fn begin_test(&mut self, test_count: usize) -> Result<usize, TransitionError> {
        if self.results.len() >= test_count {
            return Err(TransitionError::TooManyVerdicts { limit: test_count });
        }
        self.results.push(Verdict::Testing);
        self.updated_at = Utc::now();
        Ok(self.results.len())
    }

    /// Overwrite the placeholder of the running test
    pub fn record_verdict(&mut self, passed: bool) -> Result<Verdict, TransitionError> {
        let slot = self
            .results
            .last_mut()
            .filter(|slot| **slot == Verdict::Testing)
            .ok_or(TransitionError::NoTestInProgress)?;
        *slot = if passed { Verdict::Passed } else { Verdict::Failed };
        self.updated_at = Utc::now();
        Ok(*slot)
    }

    pub fn capture_streams(&mut self, exit_status: Option<i64>, stdout: &str, stderr: &str, limit: usize) {
        self.exit_status = exit_status;
        self.stdout = truncate_chars(stdout, limit);
        self.stderr = truncate_chars(stderr, limit);
        self.updated_at = Utc::now();
    }
}

/// Named base64 payload passed between pipeline stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub data: String,
}

impl Artifact {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        general_purpose::STANDARD.decode(&self.data)
    }
}

pub fn input_file_name(submission_id: &Uuid) -> String {
    format!("{}.input", submission_id)
}

pub fn output_file_name(submission_id: &Uuid) -> String {
    format!("{}.output", submission_id)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Judging specification loaded from the problem store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(default, alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub build: BuildSpec,
    #[serde(default)]
    pub test: TestSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub artifact_extension: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub evaluator: Option<String>,
    #[serde(default)]
    pub evaluator_timeout: Option<u64>,
    #[serde(default)]
    pub tests: Option<Vec<TestEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEntry {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub evaluator: Option<String>,
    #[serde(default)]
    pub evaluator_timeout: Option<u64>,
    #[serde(default)]
    pub preprocess: bool,
}

impl BuildSpec {
    pub fn image(&self) -> Option<&str> {
        non_empty(&self.image)
    }
}

impl TestSpec {
    pub fn image(&self) -> Option<&str> {
        non_empty(&self.image)
    }

    /// Per-test evaluator, falling back to the problem-wide one
    pub fn evaluator_for<'a>(&'a self, entry: &'a TestEntry) -> Option<&'a str> {
        non_empty(&entry.evaluator).or_else(|| non_empty(&self.evaluator))
    }

    pub fn evaluator_timeout_ms(&self, entry: &TestEntry, default_ms: u64) -> u64 {
        entry
            .evaluator_timeout
            .or(self.evaluator_timeout)
            .filter(|ms| *ms > 0)
            .unwrap_or(default_ms)
    }
}

impl TestEntry {
    pub fn expected_output(&self) -> Option<&str> {
        non_empty(&self.output)
    }
}

impl Problem {
    pub fn requires_build(&self) -> bool {
        self.build.image().is_some()
    }

    /// File name the build agent receives the raw source under
    pub fn build_source_name(&self, submission_id: &Uuid) -> String {
        format!(
            "{}{}",
            submission_id,
            non_empty(&self.build.extension).unwrap_or("")
        )
    }

    /// File name the test agent receives the artifact under
    ///
    /// The test extension wins; otherwise a built artifact uses the build's
    /// artifact extension and raw source keeps the build's source extension.
    pub fn artifact_name(&self, submission_id: &Uuid) -> String {
        let fallback = if self.requires_build() {
            non_empty(&self.build.artifact_extension)
        } else {
            non_empty(&self.build.extension)
        };
        let extension = non_empty(&self.test.extension).or(fallback).unwrap_or("");
        format!("{}{}", submission_id, extension)
    }
}
