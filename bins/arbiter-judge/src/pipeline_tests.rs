// End-to-end pipeline scenarios
//
// Containers come from FakeRuntime; each image's agent is a wiremock server.
// Timings are shrunk so the retry scenarios finish quickly.

use crate::agent::{AgentClient, RetryPolicy};
use crate::error::PipelineError;
use crate::evaluator::{Evaluator, EvaluatorError, ScriptRequest, ScriptRunner};
use crate::launcher::Launcher;
use crate::pipeline::{JudgeContext, JudgeSettings, PROBLEM_ID_MISSING, SOURCE_MISSING};
use crate::problems::{parse_problem, ProblemCache, ProblemError, ProblemSource};
use crate::testing::FakeRuntime;
use arbiter_common::store::{MemoryStatusStore, StatusStore, StoreError};
use arbiter_common::types::{Problem, Submission, SubmissionStatus, Verdict};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const RUN_IMAGE: &str = "judge/run";
const GCC_IMAGE: &str = "judge/gcc";

// ---------- collaborators ----------

struct StaticProblems {
    problems: HashMap<String, Problem>,
}

#[async_trait]
impl ProblemSource for StaticProblems {
    async fn lookup(&self, problem_id: &str) -> Result<Problem, ProblemError> {
        self.problems
            .get(problem_id)
            .cloned()
            .ok_or_else(|| ProblemError::NotFound(problem_id.to_string()))
    }
}

/// Keeps every snapshot it was asked to save
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStatusStore,
    history: Mutex<Vec<Submission>>,
}

impl RecordingStore {
    fn history_of(&self, id: &Uuid) -> Vec<Submission> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.id == *id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StatusStore for RecordingStore {
    async fn save(&self, submission: &Submission) -> Result<(), StoreError> {
        self.history.lock().unwrap().push(submission.clone());
        self.inner.save(submission).await
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError> {
        self.inner.load(id).await
    }
}

/// Evaluator scripts answer with a fixed verdict, or crash when none is set
struct FixedRunner {
    verdict: Option<bool>,
}

#[async_trait]
impl ScriptRunner for FixedRunner {
    async fn run(&self, _request: &ScriptRequest<'_>, _timeout: Duration) -> Result<bool, EvaluatorError> {
        self.verdict.ok_or_else(|| EvaluatorError::Script {
            status: Some(1),
            stderr: "ReferenceError: solve is not defined".to_string(),
        })
    }
}

// ---------- agents ----------

fn encode(text: &str) -> String {
    general_purpose::STANDARD.encode(text.as_bytes())
}

fn decode(data: &serde_json::Value) -> String {
    let bytes = general_purpose::STANDARD
        .decode(data.as_str().unwrap())
        .unwrap();
    String::from_utf8(bytes).unwrap()
}

fn uploaded_files(request: &Request) -> serde_json::Map<String, serde_json::Value> {
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    body["files"].as_object().unwrap().clone()
}

/// Test agent: answers each input with `solve(input)` under `<id>.output`
struct TestAgent<F> {
    solve: F,
    stdout: String,
}

impl<F> Respond for TestAgent<F>
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let files = uploaded_files(request);
        let (name, data) = files
            .iter()
            .find(|(name, _)| name.ends_with(".input"))
            .unwrap();
        let id = name.trim_end_matches(".input");
        let output = (self.solve)(&decode(data));

        let mut artifacts = serde_json::Map::new();
        artifacts.insert(format!("{}.output", id), json!(encode(&output)));
        ResponseTemplate::new(200).set_body_json(json!({
            "status": 0,
            "stdout": self.stdout,
            "stderr": "",
            "artifacts": artifacts
        }))
    }
}

/// Build agent: reports `status` and, on success, `<id>.out` = "AAEC"
struct BuildAgent {
    status: i64,
}

impl Respond for BuildAgent {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let files = uploaded_files(request);
        let name = files.keys().next().unwrap();
        let id = name.split('.').next().unwrap();

        let mut artifacts = serde_json::Map::new();
        if self.status == 0 {
            artifacts.insert(format!("{}.out", id), json!("AAEC"));
        }
        ResponseTemplate::new(200).set_body_json(json!({
            "status": self.status,
            "stdout": "",
            "stderr": if self.status == 0 { "" } else { "main.c:1:1: error: expected ';'" },
            "artifacts": artifacts
        }))
    }
}

async fn agent_server<R: Respond + 'static>(responder: R) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(responder)
        .mount(&server)
        .await;
    server
}

async fn test_agent<F>(solve: F) -> MockServer
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    agent_server(TestAgent {
        solve,
        stdout: String::new(),
    })
    .await
}

// ---------- harness ----------

fn problem(id: &str, definition: serde_json::Value) -> Problem {
    parse_problem(id, &definition.to_string()).unwrap()
}

fn single_test_problem(expected: &str) -> Problem {
    problem(
        "answer",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "extension": ".py",
                "tests": [{ "input": "", "output": expected }]
            }
        }),
    )
}

struct Harness {
    runtime: Arc<FakeRuntime>,
    store: Arc<RecordingStore>,
    judge: JudgeContext,
}

fn harness_with(
    runtime: FakeRuntime,
    problems: Vec<Problem>,
    runner: FixedRunner,
    request_timeout: Duration,
) -> Harness {
    let runtime = Arc::new(runtime);
    let store = Arc::new(RecordingStore::default());
    let source = StaticProblems {
        problems: problems.into_iter().map(|p| (p.id.clone(), p)).collect(),
    };
    let retry = RetryPolicy {
        retries: 3,
        spacing: Duration::from_millis(10),
    };

    let judge = JudgeContext {
        launcher: Launcher::new(runtime.clone(), Duration::ZERO, None),
        agent: AgentClient::new(request_timeout, retry, 1000).unwrap(),
        evaluator: Evaluator::new(Arc::new(runner)),
        problems: ProblemCache::new(Arc::new(source)),
        store: store.clone(),
        settings: JudgeSettings::default(),
    };

    Harness {
        runtime,
        store,
        judge,
    }
}

fn harness(runtime: FakeRuntime, problems: Vec<Problem>) -> Harness {
    harness_with(
        runtime,
        problems,
        FixedRunner { verdict: Some(true) },
        Duration::from_secs(2),
    )
}

impl Harness {
    async fn judge(&self, problem_id: &str, source: &str) -> Submission {
        let accepted = self.judge.accept(problem_id, source).await.unwrap();
        self.judge.run(accepted).await
    }

    async fn stored(&self, id: &Uuid) -> Submission {
        self.store.load(id).await.unwrap().unwrap()
    }
}

// ---------- scenarios ----------

#[tokio::test]
async fn test_matching_output_finishes_with_pass() {
    let agent = test_agent(|_| "42\n".to_string()).await;
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![single_test_problem("42\n")],
    );

    let submission = h.judge("answer", "print(42)").await;

    assert_eq!(submission.status, SubmissionStatus::Finished);
    assert_eq!(submission.results, vec![Verdict::Passed]);
    assert_eq!(h.stored(&submission.id).await, submission);

    assert_eq!(h.runtime.created_images(), vec![RUN_IMAGE.to_string()]);
    assert_eq!(h.runtime.removed(), h.runtime.created());

    let specs = h.runtime.specs();
    assert_eq!(specs[0].env, vec![format!("SUBMISSION_ID={}", submission.id)]);
}

#[tokio::test]
async fn test_raw_source_is_uploaded_with_input() {
    let agent = test_agent(|input| input.to_string()).await;
    let definition = problem(
        "echo",
        json!({
            "build": { "extension": ".py" },
            "test": { "image": RUN_IMAGE, "tests": [{ "input": "6 7\n", "output": "6 7\n" }] }
        }),
    );
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
    );

    let submission = h.judge("echo", "print(input())").await;
    assert_eq!(submission.results, vec![Verdict::Passed]);

    let requests = agent.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let files = uploaded_files(&requests[0]);
    assert_eq!(files.len(), 2);
    assert_eq!(decode(&files[&format!("{}.py", submission.id)]), "print(input())");
    assert_eq!(decode(&files[&format!("{}.input", submission.id)]), "6 7\n");
}

#[tokio::test]
async fn test_wrong_answer_stops_but_finishes() {
    let agent = test_agent(|_| "43\n".to_string()).await;
    let definition = problem(
        "answer",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "continueOnFailure": false,
                "tests": [
                    { "input": "", "output": "42\n" },
                    { "input": "", "output": "42\n" }
                ]
            }
        }),
    );
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
    );

    let submission = h.judge("answer", "print(43)").await;

    assert_eq!(submission.status, SubmissionStatus::Finished);
    assert_eq!(submission.results, vec![Verdict::Failed]);
    assert_eq!(h.runtime.created().len(), 1);
    assert_eq!(h.runtime.removed(), h.runtime.created());
}

#[tokio::test]
async fn test_continue_on_failure_runs_every_test() {
    let agent = test_agent(|input| {
        let n: i64 = input.trim().parse().unwrap();
        format!("{}\n", n * 2)
    })
    .await;
    let definition = problem(
        "double",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "continueOnFailure": true,
                "tests": [
                    { "input": "1", "output": "2\n" },
                    { "input": "2", "output": "5\n" },
                    { "input": "3", "output": "6", "preprocess": true }
                ]
            }
        }),
    );
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
    );

    let submission = h.judge("double", "x").await;

    assert_eq!(submission.status, SubmissionStatus::Finished);
    assert_eq!(
        submission.results,
        vec![Verdict::Passed, Verdict::Failed, Verdict::Passed]
    );
    assert_eq!(h.runtime.created().len(), 3);
    assert_eq!(h.runtime.removed(), h.runtime.created());
}

#[tokio::test]
async fn test_open_ended_test_passes() {
    let agent = test_agent(|_| "whatever\n".to_string()).await;
    let definition = problem(
        "open",
        json!({ "test": { "image": RUN_IMAGE, "tests": [{ "input": "hi" }] } }),
    );
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
    );

    let submission = h.judge("open", "x").await;
    assert_eq!(submission.results, vec![Verdict::Passed]);
}

#[tokio::test]
async fn test_empty_test_list_finishes() {
    let definition = problem("empty", json!({ "test": { "image": RUN_IMAGE, "tests": [] } }));
    let h = harness(FakeRuntime::new(), vec![definition]);

    let submission = h.judge("empty", "x").await;
    assert_eq!(submission.status, SubmissionStatus::Finished);
    assert!(submission.results.is_empty());
    assert!(h.runtime.created().is_empty());
}

fn compiled_problem() -> Problem {
    problem(
        "sum",
        json!({
            "build": { "image": GCC_IMAGE, "extension": ".c", "artifactExtension": ".out" },
            "test": {
                "image": RUN_IMAGE,
                "tests": [{ "input": "6 7\n", "output": "13\n" }]
            }
        }),
    )
}

#[tokio::test]
async fn test_build_failure_launches_no_test_container() {
    let build = agent_server(BuildAgent { status: 1 }).await;
    let run = test_agent(|_| "13\n".to_string()).await;
    let h = harness(
        FakeRuntime::new()
            .with_agent(GCC_IMAGE, *build.address())
            .with_agent(RUN_IMAGE, *run.address()),
        vec![compiled_problem()],
    );

    let submission = h.judge("sum", "int main() { return 0 }").await;

    assert_eq!(submission.status, SubmissionStatus::Failed);
    assert!(submission.results.is_empty());
    assert_eq!(submission.exit_status, Some(1));
    assert!(submission.stderr.contains("expected ';'"));

    assert_eq!(h.runtime.created_images(), vec![GCC_IMAGE.to_string()]);
    assert_eq!(h.runtime.removed(), h.runtime.created());
    assert!(run.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_built_artifact_reaches_test_agent() {
    let build = agent_server(BuildAgent { status: 0 }).await;
    let run = test_agent(|_| "13\n".to_string()).await;
    let h = harness(
        FakeRuntime::new()
            .with_agent(GCC_IMAGE, *build.address())
            .with_agent(RUN_IMAGE, *run.address()),
        vec![compiled_problem()],
    );

    let submission = h.judge("sum", "int main() {}").await;
    assert_eq!(submission.status, SubmissionStatus::Finished);
    assert_eq!(submission.results, vec![Verdict::Passed]);

    let build_requests = build.received_requests().await.unwrap();
    let build_files = uploaded_files(&build_requests[0]);
    assert_eq!(decode(&build_files[&format!("{}.c", submission.id)]), "int main() {}");

    let run_requests = run.received_requests().await.unwrap();
    let run_files = uploaded_files(&run_requests[0]);
    assert_eq!(run_files[&format!("{}.out", submission.id)], json!("AAEC"));

    assert_eq!(
        h.runtime.created_images(),
        vec![GCC_IMAGE.to_string(), RUN_IMAGE.to_string()]
    );
    assert_eq!(h.runtime.removed(), h.runtime.created());

    let statuses: Vec<SubmissionStatus> = h
        .store
        .history_of(&submission.id)
        .iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(statuses.first(), Some(&SubmissionStatus::InProgress));
    assert!(statuses.contains(&SubmissionStatus::Building));
    assert_eq!(statuses.last(), Some(&SubmissionStatus::Finished));
}

#[tokio::test]
async fn test_unresponsive_agent_fails_and_cleans_up() {
    let agent = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "status": 0, "artifacts": {} }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&agent)
        .await;
    let h = harness_with(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![single_test_problem("42\n")],
        FixedRunner { verdict: Some(true) },
        Duration::from_millis(50),
    );

    let submission = h.judge("answer", "print(42)").await;

    assert_eq!(submission.status, SubmissionStatus::Failed);
    assert_eq!(submission.results, vec![Verdict::Testing]);
    assert_eq!(agent.received_requests().await.unwrap().len(), 4);
    assert_eq!(h.runtime.created().len(), 1);
    assert_eq!(h.runtime.removed(), h.runtime.created());
}

#[tokio::test]
async fn test_missing_output_artifact_fails() {
    let agent = agent_server(
        ResponseTemplate::new(200).set_body_json(json!({
            "status": 0,
            "stdout": "",
            "stderr": "",
            "artifacts": { "unrelated.output": "NDI=" }
        })),
    )
    .await;
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![single_test_problem("42\n")],
    );

    let submission = h.judge("answer", "print(42)").await;
    assert_eq!(submission.status, SubmissionStatus::Failed);
    assert_eq!(h.runtime.removed(), h.runtime.created());
}

#[tokio::test]
async fn test_port_binding_failure_still_cleans_up() {
    let h = harness(
        FakeRuntime::new().without_ports(),
        vec![single_test_problem("42\n")],
    );

    let submission = h.judge("answer", "print(42)").await;
    assert_eq!(submission.status, SubmissionStatus::Failed);
    assert_eq!(h.runtime.created().len(), 1);
    assert_eq!(h.runtime.removed(), h.runtime.created());
}

#[tokio::test]
async fn test_evaluator_script_decides() {
    let agent = test_agent(|_| "anything".to_string()).await;
    let definition = problem(
        "scripted",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "evaluator": "return result.length > 0;",
                "tests": [{ "input": "" }]
            }
        }),
    );
    let h = harness_with(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
        FixedRunner { verdict: Some(false) },
        Duration::from_secs(2),
    );

    let submission = h.judge("scripted", "x").await;
    assert_eq!(submission.status, SubmissionStatus::Finished);
    assert_eq!(submission.results, vec![Verdict::Failed]);
}

#[tokio::test]
async fn test_evaluator_crash_is_infrastructure_failure() {
    let agent = test_agent(|_| "42".to_string()).await;
    let definition = problem(
        "scripted",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "tests": [{ "input": "", "output": "42", "evaluator": "return solve(result);" }]
            }
        }),
    );
    let h = harness_with(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
        FixedRunner { verdict: None },
        Duration::from_secs(2),
    );

    let submission = h.judge("scripted", "x").await;
    assert_eq!(submission.status, SubmissionStatus::Failed);
    assert_eq!(submission.results, vec![Verdict::Testing]);
    assert_eq!(h.runtime.removed(), h.runtime.created());
}

#[tokio::test]
async fn test_captured_streams_are_truncated() {
    let agent = agent_server(TestAgent {
        solve: |_: &str| "42\n".to_string(),
        stdout: "x".repeat(1500),
    })
    .await;
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![single_test_problem("42\n")],
    );

    let submission = h.judge("answer", "print(42)").await;
    assert_eq!(submission.stdout.chars().count(), 1000);
    assert_eq!(h.stored(&submission.id).await.stdout.chars().count(), 1000);
}

#[tokio::test]
async fn test_status_history_is_monotonic() {
    let agent = test_agent(|input| input.to_string()).await;
    let definition = problem(
        "echo",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "continueOnFailure": true,
                "tests": [
                    { "input": "a", "output": "a" },
                    { "input": "b", "output": "c" },
                    { "input": "d", "output": "d" }
                ]
            }
        }),
    );
    let h = harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
    );

    let submission = h.judge("echo", "x").await;
    let history = h.store.history_of(&submission.id);
    assert!(history.len() > 2);

    for pair in history.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        assert!(
            before.status == after.status || before.status.can_transition_to(after.status),
            "{} -> {}",
            before.status,
            after.status
        );
        assert!(after.results.len() >= before.results.len());
        assert!(after.results.len() - before.results.len() <= 1);
        assert!(after.results.len() <= 3);
    }

    // every test start is visible as a `testing` placeholder
    let placeholders = history
        .iter()
        .filter(|s| s.results.last() == Some(&Verdict::Testing))
        .count();
    assert_eq!(placeholders, 3);
}

#[tokio::test]
async fn test_concurrent_submissions_do_not_interfere() {
    let agent = test_agent(|input| input.to_string()).await;
    let definition = problem(
        "echo",
        json!({
            "test": {
                "image": RUN_IMAGE,
                "continueOnFailure": true,
                "tests": [
                    { "input": "1", "output": "1" },
                    { "input": "2", "output": "2" }
                ]
            }
        }),
    );
    let h = Arc::new(harness(
        FakeRuntime::new().with_agent(RUN_IMAGE, *agent.address()),
        vec![definition],
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let h = h.clone();
            tokio::spawn(async move { h.judge("echo", "x").await })
        })
        .collect();

    for handle in handles {
        let submission = handle.await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Finished);
        assert_eq!(submission.results, vec![Verdict::Passed, Verdict::Passed]);
    }

    assert_eq!(h.runtime.created().len(), 8);
    let mut created = h.runtime.created();
    let mut removed = h.runtime.removed();
    created.sort();
    removed.sort();
    assert_eq!(created, removed);

    let cached = h.judge.problems.get("echo").await.unwrap();
    assert_eq!(cached.test.tests.as_ref().unwrap().len(), 2);
}

// ---------- intake ----------

#[tokio::test]
async fn test_validation_errors_leave_no_record() {
    let h = harness(FakeRuntime::new(), vec![single_test_problem("42\n")]);

    let err = h.judge.accept("", "print(42)").await.unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(err.client_message(), PROBLEM_ID_MISSING);

    let err = h.judge.accept("answer", "").await.unwrap_err();
    assert_eq!(err.client_message(), SOURCE_MISSING);

    assert!(h.store.history.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_problem_marks_submission_failed() {
    let h = harness(FakeRuntime::new(), vec![]);

    let err = h.judge.accept("nope", "print(42)").await.unwrap_err();
    assert!(matches!(err, PipelineError::ProblemLookup { .. }));
    assert!(!err.is_client_error());
    assert_eq!(
        err.client_message(),
        "No problem definitions were found for the provided ID."
    );

    let history = h.store.history.lock().unwrap().clone();
    assert_eq!(history.last().unwrap().status, SubmissionStatus::Failed);
    assert_eq!(history.last().unwrap().problem_id, "nope");
    assert!(h.runtime.created().is_empty());
}

#[tokio::test]
async fn test_incomplete_problem_is_rejected() {
    let definition = problem("imageless", json!({ "test": { "tests": [{ "input": "" }] } }));
    let h = harness(FakeRuntime::new(), vec![definition]);

    let err = h.judge.accept("imageless", "x").await.unwrap_err();
    assert!(matches!(err, PipelineError::ProblemIncomplete { .. }));
    assert_eq!(err.client_message(), "The test system has failed.");
}
