// Submission record plus the store it is reported to.
// Every mutation is persisted right away; a failed write is logged and the
// pipeline carries on.

use crate::error::CapturedOutput;
use arbiter_common::store::StatusStore;
use arbiter_common::types::{Submission, SubmissionStatus, TransitionError, Verdict};
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub struct Tracker {
    submission: Submission,
    store: Arc<dyn StatusStore>,
    stream_limit: usize,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("submission", &self.submission)
            .field("stream_limit", &self.stream_limit)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    pub fn new(submission: Submission, store: Arc<dyn StatusStore>, stream_limit: usize) -> Self {
        Self {
            submission,
            store,
            stream_limit,
        }
    }

    pub fn id(&self) -> Uuid {
        self.submission.id
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub async fn persist(&self) {
        if let Err(e) = self.store.save(&self.submission).await {
            warn!(
                submission_id = %self.submission.id,
                status = %self.submission.status,
                error = %e,
                "Failed to persist submission status"
            );
        }
    }

    pub async fn advance(&mut self, next: SubmissionStatus) -> Result<(), TransitionError> {
        self.submission.transition(next)?;
        self.persist().await;
        Ok(())
    }

    pub async fn begin_test(&mut self, test_count: usize) -> Result<usize, TransitionError> {
        let test_number = self.submission.begin_test(test_count)?;
        self.persist().await;
        Ok(test_number)
    }

    /// Keep the streams of the latest agent reply; written with the next persist
    pub fn capture(&mut self, captured: &CapturedOutput) {
        self.submission.capture_streams(
            captured.exit_status,
            &captured.stdout,
            &captured.stderr,
            self.stream_limit,
        );
    }

    pub async fn record_verdict(&mut self, passed: bool) -> Result<Verdict, TransitionError> {
        let verdict = self.submission.record_verdict(passed)?;
        self.persist().await;
        Ok(verdict)
    }

    /// Move to `failed`, keeping whatever output explains the failure
    pub async fn fail(&mut self, captured: Option<&CapturedOutput>) {
        if let Some(captured) = captured {
            self.capture(captured);
        }
        if let Err(e) = self.submission.transition(SubmissionStatus::Failed) {
            warn!(submission_id = %self.submission.id, error = %e, "Submission already settled");
            return;
        }
        self.persist().await;
    }
}
