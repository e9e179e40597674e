/// Agent Protocol Client
///
/// Talks to the HTTP agent inside a build or test container:
/// `POST /process` with `{"files": {name: base64}}`, answered by
/// `{"status", "stdout", "stderr", "artifacts": {name: base64 | null}}`.
///
/// Transport errors, non-2xx replies and unparseable bodies are retried at a
/// fixed spacing. A reply that parses is final, even when it reports failure.

use crate::error::{CapturedOutput, PipelineError, RejectReason, Stage};
use crate::launcher::AgentEndpoint;
use crate::metrics;
use arbiter_common::config::{DEFAULT_AGENT_RETRIES, DEFAULT_AGENT_RETRY_SPACING_MS};
use arbiter_common::types::truncate_chars;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no usable reply after {attempts} attempts; last response status '{status}', body: {body}")]
    Exhausted {
        attempts: u32,
        status: String,
        body: String,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub spacing: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_AGENT_RETRIES,
            spacing: Duration::from_millis(DEFAULT_AGENT_RETRY_SPACING_MS),
        }
    }
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    files: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentReply {
    pub status: i64,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub artifacts: Option<HashMap<String, Option<String>>>,
}

impl AgentReply {
    pub fn captured(&self, limit: usize) -> CapturedOutput {
        CapturedOutput::new(
            self.status,
            self.stdout.as_deref().unwrap_or(""),
            self.stderr.as_deref().unwrap_or(""),
            limit,
        )
    }

    /// Pull the expected artifact out of a reply
    ///
    /// Non-zero exit, an absent key and a null value are all rejections.
    pub fn take_artifact(
        mut self,
        file: &str,
        stage: Stage,
        image: &str,
        limit: usize,
    ) -> Result<String, PipelineError> {
        let reason = if self.status != 0 {
            RejectReason::ExitStatus(self.status)
        } else {
            match self.artifacts.as_mut().and_then(|a| a.remove(file)) {
                None => RejectReason::MissingArtifact(file.to_string()),
                Some(None) => RejectReason::EmptyArtifact(file.to_string()),
                Some(Some(data)) => return Ok(data),
            }
        };

        Err(PipelineError::AgentRejected {
            stage,
            image: image.to_string(),
            reason,
            captured: self.captured(limit),
        })
    }
}

struct AttemptFailure {
    status: String,
    body: String,
}

#[derive(Clone)]
pub struct AgentClient {
    client: reqwest::Client,
    retry: RetryPolicy,
    stream_limit: usize,
}

impl AgentClient {
    pub fn new(request_timeout: Duration, retry: RetryPolicy, stream_limit: usize) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::Client(e.to_string()))?;
        Ok(Self {
            client,
            retry,
            stream_limit,
        })
    }

    /// Upload files and return the first reply that parses
    pub async fn process(
        &self,
        endpoint: &AgentEndpoint,
        files: &BTreeMap<String, String>,
    ) -> Result<AgentReply, AgentError> {
        let url = endpoint.process_url();
        let attempts = self.retry.retries + 1;
        let mut last = AttemptFailure {
            status: "-".to_string(),
            body: String::new(),
        };

        for attempt in 1..=attempts {
            match self.attempt(&url, files).await {
                Ok(reply) => {
                    debug!(url = %url, attempt, exit_status = reply.status, "Agent replied");
                    return Ok(reply);
                }
                Err(failure) => {
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts = attempts,
                        status = %failure.status,
                        detail = %failure.body,
                        "Agent request failed"
                    );
                    last = failure;
                    if attempt < attempts {
                        metrics::AGENT_RETRIES.inc();
                        tokio::time::sleep(self.retry.spacing).await;
                    }
                }
            }
        }

        Err(AgentError::Exhausted {
            attempts,
            status: last.status,
            body: last.body,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<AgentReply, AttemptFailure> {
        let response = self
            .client
            .post(url)
            .json(&ProcessRequest { files })
            .send()
            .await
            .map_err(|e| AttemptFailure {
                status: "-".to_string(),
                body: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AttemptFailure {
            status: status.as_u16().to_string(),
            body: format!("failed to read reply body: {}", e),
        })?;

        if !status.is_success() {
            return Err(AttemptFailure {
                status: status.as_u16().to_string(),
                body: truncate_chars(&body, self.stream_limit),
            });
        }

        serde_json::from_str(&body).map_err(|e| AttemptFailure {
            status: status.as_u16().to_string(),
            body: format!("malformed reply ({}): {}", e, truncate_chars(&body, self.stream_limit)),
        })
    }
}
