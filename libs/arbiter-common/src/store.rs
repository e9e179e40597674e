//! Submission status persistence
//!
//! The pipeline writes a full snapshot of the submission on every transition;
//! the status endpoint reads the latest one back. Writes are best-effort from
//! the pipeline's point of view: a failed write is logged, never fatal.

use crate::types::Submission;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("corrupt submission record '{key}': {message}")]
    Corrupt { key: String, message: String },
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn save(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError>;
}

/// Process-local store, used when no Redis is configured and in tests
///
/// Built with `new()` it keeps every record for the life of the process.
/// `with_ttl` gives each record the same lifetime the Redis store sets with
/// `EXPIRE`: a record not written for `ttl` is dropped on the next save and
/// is no longer returned by `load`.
#[derive(Default)]
pub struct MemoryStatusStore {
    submissions: RwLock<HashMap<Uuid, (Submission, Instant)>>,
    ttl: Option<Duration>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            submissions: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    pub async fn len(&self) -> usize {
        self.submissions.read().await.len()
    }

    fn is_live(&self, written: Instant, now: Instant) -> bool {
        self.ttl
            .map_or(true, |ttl| now.saturating_duration_since(written) < ttl)
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn save(&self, submission: &Submission) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut submissions = self.submissions.write().await;
        if self.ttl.is_some() {
            submissions.retain(|_, (_, written)| self.is_live(*written, now));
        }
        submissions.insert(submission.id, (submission.clone(), now));
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError> {
        let now = Instant::now();
        Ok(self
            .submissions
            .read()
            .await
            .get(id)
            .filter(|(_, written)| self.is_live(*written, now))
            .map(|(submission, _)| submission.clone()))
    }
}
