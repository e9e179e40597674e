use crate::store::{StatusStore, StoreError};
use crate::types::{decode_verdicts, encode_verdicts, Submission, SubmissionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Redis key semantics - shared by the judge service and any tooling that
/// seeds problems, so both agree on where things live

pub const SUBMISSION_PREFIX: &str = "arbiter:submission";
pub const PROBLEM_PREFIX: &str = "arbiter:problem";

/// Hash key holding a submission's status fields
pub fn submission_key(submission_id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, submission_id)
}

/// String key holding a problem definition as JSON
pub fn problem_key(problem_id: &str) -> String {
    format!("{}:{}", PROBLEM_PREFIX, problem_id)
}

/// Flatten a submission into hash fields; verdicts become a comma-delimited list
pub fn encode_submission(submission: &Submission) -> Vec<(&'static str, String)> {
    vec![
        ("id", submission.id.to_string()),
        ("problem_id", submission.problem_id.clone()),
        ("status", submission.status.as_str().to_string()),
        ("results", encode_verdicts(&submission.results)),
        ("stdout", submission.stdout.clone()),
        ("stderr", submission.stderr.clone()),
        (
            "exit_status",
            submission
                .exit_status
                .map(|code| code.to_string())
                .unwrap_or_default(),
        ),
        ("created_at", submission.created_at.to_rfc3339()),
        ("updated_at", submission.updated_at.to_rfc3339()),
    ]
}

/// Rebuild a submission from its hash fields
pub fn decode_submission(key: &str, fields: &HashMap<String, String>) -> Result<Submission, StoreError> {
    let corrupt = |message: String| StoreError::Corrupt {
        key: key.to_string(),
        message,
    };
    let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or("");

    let id = Uuid::parse_str(field("id")).map_err(|e| corrupt(format!("invalid id: {}", e)))?;
    let status = SubmissionStatus::parse(field("status"))
        .ok_or_else(|| corrupt(format!("unknown status '{}'", field("status"))))?;
    let exit_status = match field("exit_status") {
        "" => None,
        raw => Some(
            raw.parse::<i64>()
                .map_err(|e| corrupt(format!("invalid exit status: {}", e)))?,
        ),
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        match field(name) {
            "" => Ok(Utc::now()),
            raw => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("invalid {}: {}", name, e))),
        }
    };

    Ok(Submission {
        id,
        problem_id: field("problem_id").to_string(),
        status,
        results: decode_verdicts(field("results")),
        stdout: field("stdout").to_string(),
        stderr: field("stderr").to_string(),
        exit_status,
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}

/// Status store backed by one Redis hash per submission
#[derive(Clone)]
pub struct RedisStatusStore {
    conn: redis::aio::ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStatusStore {
    pub fn new(conn: redis::aio::ConnectionManager, ttl_seconds: u64) -> Self {
        Self { conn, ttl_seconds }
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn save(&self, submission: &Submission) -> Result<(), StoreError> {
        let key = submission_key(&submission.id);
        let fields = encode_submission(submission);
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields[..])
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError> {
        let key = submission_key(id);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_submission(&key, &fields).map(Some)
    }
}

/// Fetch a problem definition's raw JSON
pub async fn load_problem_json(
    conn: &mut redis::aio::ConnectionManager,
    problem_id: &str,
) -> RedisResult<Option<String>> {
    conn.get(problem_key(problem_id)).await
}
