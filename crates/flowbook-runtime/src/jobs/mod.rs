//! Long-running remote jobs
//!
//! Research-style blocks hand their work to a remote service that takes minutes to
//! answer. Each block owns at most one job, identified by a [`JobKey`] (workflow id plus
//! block id). Its status moves forward only:
//!
//! ```text
//! idle -> waiting -> processing -> complete
//!                             \-> error
//! ```
//!
//! `complete` and `error` are terminal until the job is restarted, which returns it to
//! `waiting` under a new request id. Cancelling resets it to `idle`.
//!
//! Remote services report progress either by being polled ([`PollProtocol`]) or by
//! pushing updates ([`StreamProtocol`]). The scheduler behind [`JobSchedulerHandle`] owns every
//! active job and applies updates only when they carry the job's current request id.

mod http;
mod protocol;
mod scheduler;
mod selection;

pub use http::{HttpPollProtocol, HttpStreamProtocol};
pub use protocol::{
    JobProtocol, PollProtocol, PollStatus, StreamProtocol, StreamStatus, StreamUpdate,
};
pub use scheduler::{JobEvent, JobSchedulerConfig, JobSchedulerHandle};
pub use selection::SelectionChange;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::client::ApiError;
use crate::storage::StorageError;
use crate::variables::VariableError;

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("Invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Research is already running for block {0}")]
    AlreadyRunning(Uuid),

    #[error("No job found for block {0}")]
    NotFound(Uuid),

    #[error("Results are not available yet")]
    NotFinished,

    #[error("No protocol registered for research engine {0:?}")]
    NoProtocol(ResearchEngine),

    #[error("Request {0} is no longer current")]
    Stale(Uuid),

    #[error("Result {0} does not exist")]
    InvalidSelection(usize),

    #[error("Remote call failed: {0}")]
    Api(#[from] ApiError),

    #[error("Failed to persist job status: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to save results: {0}")]
    Variable(#[from] VariableError),

    #[error("Job scheduler is not running")]
    SchedulerGone,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for JobError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        JobError::SchedulerGone
    }
}

/// Identifies the job owned by one block of one workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub workflow_id: Uuid,
    pub block_id: Uuid,
}

impl JobKey {
    pub fn new(workflow_id: Uuid, block_id: Uuid) -> Self {
        Self {
            workflow_id,
            block_id,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.block_id)
    }
}

/// Remote research services, each bound to one protocol
#[derive(TS, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ResearchEngine {
    /// Polled research service
    #[default]
    Perplexity,
    /// Streaming deep research service
    Deep,
}

#[derive(TS, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum JobState {
    #[default]
    Idle,
    Waiting,
    Processing,
    Complete,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    /// Idle jobs have nothing in flight; terminal jobs are finished
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Processing)
    }

    /// Whether `next` is a forward step from this state
    pub fn can_advance_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Idle, JobState::Waiting)
                | (
                    JobState::Waiting,
                    JobState::Processing | JobState::Complete | JobState::Error
                )
                | (JobState::Processing, JobState::Complete | JobState::Error)
        )
    }
}

/// One result item, typically a cited source
#[derive(TS, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[ts(export)]
pub struct ResearchItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ResearchItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }
}

#[derive(TS, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[ts(export)]
pub struct JobResult {
    pub summary: String,
    pub items: Vec<ResearchItem>,
}

/// Persisted status of one block's job
#[derive(TS, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AsyncJobStatus {
    pub status: JobState,
    pub engine: ResearchEngine,
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub query: String,
    /// Latest partial output reported while the job runs
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub error: Option<String>,
    /// Indexes into `result.items` chosen by the operator
    #[serde(default)]
    pub selected: BTreeSet<usize>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

impl AsyncJobStatus {
    pub fn new(engine: ResearchEngine) -> Self {
        Self {
            status: JobState::Idle,
            engine,
            request_id: None,
            query: String::new(),
            progress: None,
            result: None,
            error: None,
            selected: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Start (or restart) under a new request id. Not allowed while a job is in flight.
    pub fn begin(&mut self, request_id: Uuid, query: impl Into<String>) -> Result<(), JobError> {
        if self.status.is_active() {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobState::Waiting,
            });
        }
        self.status = JobState::Waiting;
        self.request_id = Some(request_id);
        self.query = query.into();
        self.progress = None;
        self.result = None;
        self.error = None;
        self.selected.clear();
        self.touch();
        Ok(())
    }

    /// Move forward to `next`. Repeating the current state is a no-op.
    pub fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_advance_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self, result: JobResult) -> Result<(), JobError> {
        self.finish(JobState::Complete)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.finish(JobState::Error)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Terminal states are entered exactly once
    fn finish(&mut self, terminal: JobState) -> Result<(), JobError> {
        if !self.status.can_advance_to(terminal) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: terminal,
            });
        }
        self.advance(terminal)
    }

    /// Drop the in-flight request and return to idle
    pub fn reset(&mut self) {
        self.status = JobState::Idle;
        self.request_id = None;
        self.progress = None;
        self.touch();
    }

    /// Whether an update tagged with `request_id` belongs to the current request
    pub fn is_current_request(&self, request_id: Uuid) -> bool {
        self.request_id == Some(request_id)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
