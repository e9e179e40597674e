/// Output Evaluator - Pass/Fail for One Test
///
/// **Decision Rules (in order):**
/// - No expected output and no evaluator script: the test passes
/// - `preprocess` set: leading/trailing whitespace is trimmed from the output
/// - Evaluator script configured: the script decides
/// - Otherwise: exact string equality with the expected output
///
/// **Evaluator Scripts:**
/// A script is the body of `function(input, output, result)` where `output`
/// is the expected output and `result` the actual one. It runs in a separate
/// interpreter process with a cleared environment. The script's own budget is
/// enforced inside the interpreter; the process as a whole is killed once that
/// budget plus a startup allowance runs out. A crash or timeout means the test
/// could not be judged, which is an error, not a failed verdict.

use arbiter_common::config::DEFAULT_EVALUATOR_STARTUP_ALLOWANCE_MS;
use arbiter_common::types::truncate_chars;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Harness run by `node -e`: reads one request from stdin, evaluates the
/// script in a fresh vm context and prints `{"verdict": bool}`, or
/// `{"timed_out": true}` when the script exceeds `timeout_ms`
pub const NODE_HARNESS: &str = r#"
const vm = require("vm");
let raw = "";
process.stdin.setEncoding("utf8");
process.stdin.on("data", chunk => { raw += chunk; });
process.stdin.on("end", () => {
  const request = JSON.parse(raw);
  const sandbox = {
    testInput: request.input,
    correctOutput: request.expected === null ? undefined : request.expected,
    testOutput: request.actual,
    evaluatorResult: false
  };
  const source =
    "evaluatorResult = (function(input, output, result) {" +
    request.script +
    "\n})(testInput, correctOutput, testOutput);";
  try {
    vm.runInNewContext(source, sandbox, { timeout: request.timeout_ms });
  } catch (error) {
    if (error && error.code === "ERR_SCRIPT_EXECUTION_TIMEOUT") {
      process.stdout.write(JSON.stringify({ timed_out: true }));
      return;
    }
    throw error;
  }
  process.stdout.write(JSON.stringify({ verdict: !!sandbox.evaluatorResult }));
});
"#;

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("evaluator timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("evaluator script failed (exit status {status:?}): {stderr}")]
    Script { status: Option<i32>, stderr: String },

    #[error("evaluator produced an unreadable verdict: {0}")]
    Protocol(String),

    #[error("failed to run the evaluator process: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a script sees, sent to the interpreter as JSON
#[derive(Debug, Clone, Serialize)]
pub struct ScriptRequest<'a> {
    pub script: &'a str,
    pub input: &'a str,
    pub expected: Option<&'a str>,
    pub actual: &'a str,
    pub timeout_ms: u64,
}

#[derive(Deserialize)]
struct ScriptVerdict {
    #[serde(default)]
    verdict: Option<bool>,
    #[serde(default)]
    timed_out: bool,
}

/// Seam for executing evaluator scripts
///
/// `timeout` is the script's own budget, not counting interpreter startup.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, request: &ScriptRequest<'_>, timeout: Duration) -> Result<bool, EvaluatorError>;
}

/// Runs each script in a fresh interpreter process
pub struct ProcessScriptRunner {
    program: String,
    args: Vec<String>,
    stream_limit: usize,
    startup_allowance: Duration,
}

impl ProcessScriptRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, stream_limit: usize) -> Self {
        Self {
            program: program.into(),
            args,
            stream_limit,
            startup_allowance: Duration::from_millis(DEFAULT_EVALUATOR_STARTUP_ALLOWANCE_MS),
        }
    }

    /// Extra time granted on top of the script budget before the process is killed
    pub fn with_startup_allowance(mut self, allowance: Duration) -> Self {
        self.startup_allowance = allowance;
        self
    }

    /// Node interpreter with the built-in harness
    pub fn node(program: impl Into<String>, stream_limit: usize) -> Self {
        Self::new(
            program,
            vec!["-e".to_string(), NODE_HARNESS.to_string()],
            stream_limit,
        )
    }
}

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn run(&self, request: &ScriptRequest<'_>, timeout: Duration) -> Result<bool, EvaluatorError> {
        let payload = serde_json::to_vec(request).map_err(|e| EvaluatorError::Protocol(e.to_string()))?;

        // Only PATH survives, so the interpreter itself can be found
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EvaluatorError::Protocol("interpreter stdin unavailable".to_string()))?;

        let exchange = async move {
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
            drop(stdin);
            child.wait_with_output().await
        };

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout + self.startup_allowance, exchange)
            .await
            .map_err(|_| EvaluatorError::Timeout(timeout))??;

        if !output.status.success() {
            return Err(EvaluatorError::Script {
                status: output.status.code(),
                stderr: truncate_chars(&String::from_utf8_lossy(&output.stderr), self.stream_limit),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let unreadable = |detail: String| {
            EvaluatorError::Protocol(format!(
                "{}: {}",
                detail,
                truncate_chars(&stdout, self.stream_limit)
            ))
        };
        let reply = serde_json::from_str::<ScriptVerdict>(stdout.trim())
            .map_err(|e| unreadable(e.to_string()))?;

        if reply.timed_out {
            return Err(EvaluatorError::Timeout(timeout));
        }
        reply
            .verdict
            .ok_or_else(|| unreadable("reply carries no verdict".to_string()))
    }
}

/// How to judge one test
#[derive(Debug, Clone)]
pub struct EvaluationCase<'a> {
    pub input: &'a str,
    pub expected: Option<&'a str>,
    pub script: Option<&'a str>,
    pub timeout: Duration,
    pub preprocess: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub passed: bool,
    /// Output as it was compared, after preprocessing
    pub compared_output: String,
}

#[derive(Clone)]
pub struct Evaluator {
    runner: Arc<dyn ScriptRunner>,
}

impl Evaluator {
    pub fn new(runner: Arc<dyn ScriptRunner>) -> Self {
        Self { runner }
    }

    pub async fn evaluate(&self, case: &EvaluationCase<'_>, actual: &str) -> Result<Evaluation, EvaluatorError> {
        if case.expected.is_none() && case.script.is_none() {
            return Ok(Evaluation {
                passed: true,
                compared_output: actual.to_string(),
            });
        }

        let processed = if case.preprocess { actual.trim() } else { actual };

        let passed = match case.script {
            Some(script) => {
                let request = ScriptRequest {
                    script,
                    input: case.input,
                    expected: case.expected,
                    actual: processed,
                    timeout_ms: case.timeout.as_millis() as u64,
                };
                self.runner.run(&request, case.timeout).await?
            }
            None => case.expected == Some(processed),
        };

        Ok(Evaluation {
            passed,
            compared_output: processed.to_string(),
        })
    }
}
