/// Problem Definitions - Lookup and Process-Wide Cache
///
/// **Sources:**
/// - `FileProblemSource`: one `<id>.json` file per problem in a directory
/// - `RedisProblemSource`: JSON string under `arbiter:problem:<id>`
///
/// **Cache:**
/// Populated on miss, read by every concurrent pipeline, never invalidated.
/// When two lookups for the same id race, the first insert wins and both
/// callers share it.

use arbiter_common::redis::load_problem_json;
use arbiter_common::types::Problem;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ProblemError {
    #[error("no problem definition exists for '{0}'")]
    NotFound(String),

    #[error("'{0}' is not a valid problem id")]
    InvalidId(String),

    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("problem store: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("definition of '{problem_id}' is not valid: {source}")]
    Parse {
        problem_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ProblemSource: Send + Sync {
    async fn lookup(&self, problem_id: &str) -> Result<Problem, ProblemError>;
}

/// Parse a stored definition; an id missing from the body is taken from the key
pub fn parse_problem(problem_id: &str, raw: &str) -> Result<Problem, ProblemError> {
    let mut problem: Problem = serde_json::from_str(raw).map_err(|source| ProblemError::Parse {
        problem_id: problem_id.to_string(),
        source,
    })?;
    if problem.id.is_empty() {
        problem.id = problem_id.to_string();
    }
    Ok(problem)
}

/// Presence checks a definition must pass before anything is launched
pub fn ensure_runnable(problem: &Problem) -> Result<(), String> {
    if problem.test.image().is_none() {
        return Err("no test image is configured".to_string());
    }
    if problem.test.tests.is_none() {
        return Err("no test list is configured".to_string());
    }
    Ok(())
}

pub struct FileProblemSource {
    dir: PathBuf,
}

impl FileProblemSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, problem_id: &str) -> Result<PathBuf, ProblemError> {
        let plain = !problem_id.is_empty()
            && problem_id != "."
            && problem_id != ".."
            && !problem_id.contains(['/', '\\', '\0']);
        if !plain {
            return Err(ProblemError::InvalidId(problem_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", problem_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ProblemSource for FileProblemSource {
    async fn lookup(&self, problem_id: &str) -> Result<Problem, ProblemError> {
        let path = self.path_for(problem_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProblemError::NotFound(problem_id.to_string()));
            }
            Err(source) => {
                return Err(ProblemError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        parse_problem(problem_id, &raw)
    }
}

pub struct RedisProblemSource {
    conn: redis::aio::ConnectionManager,
}

impl RedisProblemSource {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProblemSource for RedisProblemSource {
    async fn lookup(&self, problem_id: &str) -> Result<Problem, ProblemError> {
        let mut conn = self.conn.clone();
        match load_problem_json(&mut conn, problem_id).await? {
            Some(raw) => parse_problem(problem_id, &raw),
            None => Err(ProblemError::NotFound(problem_id.to_string())),
        }
    }
}

pub struct ProblemCache {
    source: Arc<dyn ProblemSource>,
    entries: RwLock<HashMap<String, Arc<Problem>>>,
}

impl ProblemCache {
    pub fn new(source: Arc<dyn ProblemSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, problem_id: &str) -> Result<Arc<Problem>, ProblemError> {
        if let Some(problem) = self.entries.read().await.get(problem_id) {
            debug!(problem_id = %problem_id, "Problem cache hit");
            return Ok(problem.clone());
        }

        let loaded = Arc::new(self.source.lookup(problem_id).await?);

        let mut entries = self.entries.write().await;
        let problem = entries
            .entry(problem_id.to_string())
            .or_insert_with(|| {
                info!(problem_id = %problem_id, "Problem definition cached");
                loaded
            })
            .clone();
        Ok(problem)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
