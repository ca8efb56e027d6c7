//! Durable storage for workflow state
//!
//! Everything that must survive a reload lives behind [`WorkflowStorage`]: variables,
//! workflow documents (with their blocks) and async job status records. Records are
//! addressed by workflow id plus entity id.
//!
//! Run-scoped state such as per-block processing flags is never written here.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use uuid::Uuid;

use crate::jobs::{AsyncJobStatus, JobKey};
use crate::variables::Variable;
use crate::workflow::Workflow;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode stored record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stored record not found: {0}")]
    NotFound(String),
}

/// A trait for persisting workflow state.
#[async_trait::async_trait]
pub trait WorkflowStorage: Send + Sync {
    /// Save a variable, keyed by its workflow id and variable id.
    async fn save_variable(&self, variable: &Variable) -> Result<(), StorageError>;

    /// Delete a variable from storage.
    async fn delete_variable(&self, workflow_id: Uuid, variable_id: Uuid)
        -> Result<(), StorageError>;

    /// Load every variable of a workflow, oldest first.
    async fn load_variables(&self, workflow_id: Uuid) -> Result<Vec<Variable>, StorageError>;

    /// Save a workflow document, including its blocks.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError>;

    /// Load a workflow document.
    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>, StorageError>;

    /// Save the status record of one block's async job.
    async fn save_job_status(
        &self,
        key: &JobKey,
        status: &AsyncJobStatus,
    ) -> Result<(), StorageError>;

    /// Load the status record of one block's async job.
    async fn load_job_status(&self, key: &JobKey) -> Result<Option<AsyncJobStatus>, StorageError>;

    /// Load every job status record of a workflow.
    async fn load_job_statuses(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(JobKey, AsyncJobStatus)>, StorageError>;

    /// Delete a job status record.
    async fn delete_job_status(&self, key: &JobKey) -> Result<(), StorageError>;
}
