/// Pipeline Controller - One Submission, Start to Finish
///
/// **State Machine:**
/// `in progress` → `building` (only with a build image) → `testing` →
/// `finished` | `failed`
///
/// **Responsibilities:**
/// 1. Validate the request and open the submission record (`accept`)
/// 2. Resolve the problem definition through the cache
/// 3. Build the submission, or use the raw source as the artifact
/// 4. Hand the artifact to the test sequencer
/// 5. Settle the submission and remove every container it created (`run`)
///
/// Wrong answers end in `finished`. Only infrastructure errors end in `failed`.

use crate::agent::AgentClient;
use crate::error::{PipelineError, Stage};
use crate::evaluator::Evaluator;
use crate::launcher::{ContainerSet, ContainerSpec, Launcher};
use crate::metrics;
use crate::problems::{ensure_runnable, ProblemCache};
use crate::sequencer;
use crate::tracker::Tracker;
use arbiter_common::config::{
    DEFAULT_BUILD_AGENT_PORT, DEFAULT_EVALUATOR_TIMEOUT_MS, DEFAULT_STREAM_CHAR_LIMIT,
    DEFAULT_TEST_AGENT_PORT,
};
use arbiter_common::store::StatusStore;
use arbiter_common::types::{Artifact, Problem, Submission, SubmissionStatus};
use base64::{engine::general_purpose, Engine as _};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

pub const PROBLEM_ID_MISSING: &str = "The problem ID was not provided.";
pub const SOURCE_MISSING: &str = "Submission sources were not provided.";

#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub build_agent_port: u16,
    pub test_agent_port: u16,
    pub stream_limit: usize,
    pub evaluator_timeout: Duration,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            build_agent_port: DEFAULT_BUILD_AGENT_PORT,
            test_agent_port: DEFAULT_TEST_AGENT_PORT,
            stream_limit: DEFAULT_STREAM_CHAR_LIMIT,
            evaluator_timeout: Duration::from_millis(DEFAULT_EVALUATOR_TIMEOUT_MS),
        }
    }
}

/// Collaborators shared by every pipeline in the process
pub struct JudgeContext {
    pub launcher: Launcher,
    pub agent: AgentClient,
    pub evaluator: Evaluator,
    pub problems: ProblemCache,
    pub store: Arc<dyn StatusStore>,
    pub settings: JudgeSettings,
}

/// A submission that passed intake and is ready to be judged
#[derive(Debug)]
pub struct Accepted {
    tracker: Tracker,
    problem: Arc<Problem>,
    source: String,
}

impl Accepted {
    pub fn id(&self) -> Uuid {
        self.tracker.id()
    }
}

/// Environment and labels every pipeline container gets
pub fn container_spec(image: &str, submission_id: &Uuid, stage: Stage) -> ContainerSpec {
    let mut labels = HashMap::new();
    labels.insert("arbiter.submission".to_string(), submission_id.to_string());
    labels.insert("arbiter.stage".to_string(), stage.to_string());

    ContainerSpec {
        image: image.to_string(),
        env: vec![format!("SUBMISSION_ID={}", submission_id)],
        labels,
    }
}

impl JudgeContext {
    /// Validate a request, open its record and resolve the problem
    ///
    /// Validation errors leave no record behind. Once the record exists, a
    /// problem that cannot be resolved marks it `failed`.
    pub async fn accept(&self, problem_id: &str, source_text: &str) -> Result<Accepted, PipelineError> {
        let problem_id = problem_id.trim();
        if problem_id.is_empty() {
            return Err(PipelineError::Validation(PROBLEM_ID_MISSING.to_string()));
        }
        if source_text.is_empty() {
            return Err(PipelineError::Validation(SOURCE_MISSING.to_string()));
        }

        let tracker = Tracker::new(
            Submission::new(problem_id),
            self.store.clone(),
            self.settings.stream_limit,
        );
        tracker.persist().await;
        info!(submission_id = %tracker.id(), problem_id = %problem_id, "Submission accepted");

        let resolved = match self.problems.get(problem_id).await {
            Ok(problem) => ensure_runnable(&problem)
                .map(|_| problem)
                .map_err(|message| PipelineError::ProblemIncomplete {
                    problem_id: problem_id.to_string(),
                    message,
                }),
            Err(source) => Err(PipelineError::ProblemLookup {
                problem_id: problem_id.to_string(),
                source,
            }),
        };

        match resolved {
            Ok(problem) => Ok(Accepted {
                tracker,
                problem,
                source: source_text.to_string(),
            }),
            Err(e) => {
                let mut tracker = tracker;
                self.fail(&mut tracker, &e).await;
                metrics::SUBMISSIONS_TOTAL.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    /// Drive an accepted submission to a terminal status
    #[tracing::instrument(
        skip_all,
        fields(submission_id = %accepted.tracker.id(), problem_id = %accepted.problem.id)
    )]
    pub async fn run(&self, accepted: Accepted) -> Submission {
        let started = Instant::now();
        let Accepted {
            mut tracker,
            problem,
            source,
        } = accepted;
        let mut containers = ContainerSet::new(self.launcher.runtime());

        let outcome = match self.judge(&mut tracker, &problem, &source, &mut containers).await {
            Ok(()) => tracker
                .advance(SubmissionStatus::Finished)
                .await
                .map_err(PipelineError::from),
            Err(e) => Err(e),
        };

        containers.release_all().await;

        let outcome_label = match outcome {
            Ok(()) => {
                info!(results = ?tracker.submission().results, "Submission finished");
                "finished"
            }
            Err(e) => {
                self.fail(&mut tracker, &e).await;
                "failed"
            }
        };

        metrics::SUBMISSIONS_TOTAL
            .with_label_values(&[outcome_label])
            .inc();
        metrics::PIPELINE_DURATION.observe(started.elapsed().as_secs_f64());

        tracker.submission().clone()
    }

    async fn judge(
        &self,
        tracker: &mut Tracker,
        problem: &Problem,
        source: &str,
        containers: &mut ContainerSet,
    ) -> Result<(), PipelineError> {
        let artifact = match problem.build.image() {
            Some(image) => {
                tracker.advance(SubmissionStatus::Building).await?;
                self.build(tracker, problem, image, source, containers).await?
            }
            None => Artifact::from_bytes(problem.artifact_name(&tracker.id()), source.as_bytes()),
        };

        tracker.advance(SubmissionStatus::Testing).await?;
        sequencer::run_tests(self, tracker, problem, &artifact, containers).await
    }

    async fn build(
        &self,
        tracker: &mut Tracker,
        problem: &Problem,
        image: &str,
        source: &str,
        containers: &mut ContainerSet,
    ) -> Result<Artifact, PipelineError> {
        let submission_id = tracker.id();
        let spec = container_spec(image, &submission_id, Stage::Build);
        let container = self
            .launcher
            .launch(Stage::Build, &spec, self.settings.build_agent_port, containers)
            .await?;

        let mut files = BTreeMap::new();
        files.insert(
            problem.build_source_name(&submission_id),
            general_purpose::STANDARD.encode(source.as_bytes()),
        );

        let reply = self
            .agent
            .process(&container.endpoint, &files)
            .await
            .map_err(|source| PipelineError::AgentUnreachable {
                stage: Stage::Build,
                image: image.to_string(),
                source,
            })?;
        tracker.capture(&reply.captured(self.settings.stream_limit));

        let name = problem.artifact_name(&submission_id);
        let data = reply.take_artifact(&name, Stage::Build, image, self.settings.stream_limit)?;
        let artifact = Artifact { name, data };
        artifact
            .decode()
            .map_err(|e| PipelineError::MalformedArtifact {
                stage: Stage::Build,
                image: image.to_string(),
                file: artifact.name.clone(),
                detail: e.to_string(),
            })?;

        containers.release(&container.id).await;
        info!(image = %image, artifact = %artifact.name, "Build finished");
        Ok(artifact)
    }

    async fn fail(&self, tracker: &mut Tracker, failure: &PipelineError) {
        let captured = failure.captured();
        error!(
            submission_id = %tracker.id(),
            problem_id = %tracker.submission().problem_id,
            message = %failure.client_message(),
            error = %failure,
            exit_status = ?captured.and_then(|c| c.exit_status),
            stdout = %captured.map(|c| c.stdout.as_str()).unwrap_or(""),
            stderr = %captured.map(|c| c.stderr.as_str()).unwrap_or(""),
            "Submission failed"
        );
        tracker.fail(captured).await;
    }
}
