/// Test Sequencer - Ordered, One Container at a Time
///
/// For each test: placeholder verdict → fresh container → one agent round
/// trip with the artifact and the test input → evaluation → verdict →
/// container removed. Test N+1 never starts before test N's container is gone.
///
/// A failed verdict stops the run unless the problem continues on failure.
/// Either way the run itself succeeded; only infrastructure errors escape.

use crate::error::{PipelineError, Stage};
use crate::evaluator::EvaluationCase;
use crate::launcher::ContainerSet;
use crate::metrics;
use crate::pipeline::{container_spec, JudgeContext};
use crate::tracker::Tracker;
use arbiter_common::types::{
    input_file_name, output_file_name, truncate_chars, Artifact, Problem, TestEntry, Verdict,
};
use base64::{engine::general_purpose, Engine as _};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub async fn run_tests(
    ctx: &JudgeContext,
    tracker: &mut Tracker,
    problem: &Problem,
    artifact: &Artifact,
    containers: &mut ContainerSet,
) -> Result<(), PipelineError> {
    let image = problem
        .test
        .image()
        .ok_or_else(|| PipelineError::ProblemIncomplete {
            problem_id: problem.id.clone(),
            message: "no test image is configured".to_string(),
        })?;

    // Private copy; the cached problem is shared with concurrent pipelines
    let tests: Vec<TestEntry> = problem.test.tests.clone().unwrap_or_default();
    let total = tests.len();
    let submission_id = tracker.id();
    let input_name = input_file_name(&submission_id);
    let output_name = output_file_name(&submission_id);
    let limit = ctx.settings.stream_limit;

    for entry in &tests {
        let test_number = tracker.begin_test(total).await?;

        let spec = container_spec(image, &submission_id, Stage::Test);
        let container = ctx
            .launcher
            .launch(Stage::Test, &spec, ctx.settings.test_agent_port, containers)
            .await?;

        let mut files = BTreeMap::new();
        files.insert(artifact.name.clone(), artifact.data.clone());
        files.insert(
            input_name.clone(),
            general_purpose::STANDARD.encode(entry.input.as_bytes()),
        );

        let reply = ctx
            .agent
            .process(&container.endpoint, &files)
            .await
            .map_err(|source| PipelineError::AgentUnreachable {
                stage: Stage::Test,
                image: image.to_string(),
                source,
            })?;
        tracker.capture(&reply.captured(limit));

        let encoded = reply.take_artifact(&output_name, Stage::Test, image, limit)?;
        let bytes = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| PipelineError::MalformedArtifact {
                stage: Stage::Test,
                image: image.to_string(),
                file: output_name.clone(),
                detail: e.to_string(),
            })?;
        let actual = String::from_utf8_lossy(&bytes);

        let case = EvaluationCase {
            input: &entry.input,
            expected: entry.expected_output(),
            script: problem.test.evaluator_for(entry),
            timeout: Duration::from_millis(
                problem
                    .test
                    .evaluator_timeout_ms(entry, ctx.settings.evaluator_timeout.as_millis() as u64),
            ),
            preprocess: entry.preprocess,
        };
        let evaluation = ctx
            .evaluator
            .evaluate(&case, &actual)
            .await
            .map_err(|source| PipelineError::Evaluator {
                test_number,
                source,
            })?;

        let verdict = tracker.record_verdict(evaluation.passed).await?;
        containers.release(&container.id).await;
        metrics::TESTS_TOTAL
            .with_label_values(&[verdict.as_str()])
            .inc();

        if verdict == Verdict::Passed {
            info!(
                test_number,
                total,
                input = %truncate_chars(&entry.input, limit),
                output = %truncate_chars(&evaluation.compared_output, limit),
                "Test passed"
            );
            continue;
        }

        warn!(
            test_number,
            total,
            input = %truncate_chars(&entry.input, limit),
            output = %truncate_chars(&evaluation.compared_output, limit),
            expected = %truncate_chars(entry.expected_output().unwrap_or(""), limit),
            "Test failed"
        );
        if !problem.test.continue_on_failure {
            info!(test_number, skipped = total - test_number, "Stopping after the first failed test");
            break;
        }
    }

    Ok(())
}
