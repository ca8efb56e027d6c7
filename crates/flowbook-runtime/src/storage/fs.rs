use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::jobs::{AsyncJobStatus, JobKey};
use crate::storage::{StorageError, WorkflowStorage};
use crate::variables::Variable;
use crate::workflow::Workflow;

/// Storage backed by JSON files on disk
///
/// Layout, relative to the root directory:
///
/// ```text
/// workflows/<workflow id>/workflow.json
/// workflows/<workflow id>/variables/<variable id>.json
/// workflows/<workflow id>/jobs/<block id>.json
/// ```
///
/// Each file is written to a uniquely named temporary sibling first and then renamed into
/// place.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_dir(&self, workflow_id: Uuid) -> PathBuf {
        self.root.join("workflows").join(workflow_id.to_string())
    }

    fn variables_dir(&self, workflow_id: Uuid) -> PathBuf {
        self.workflow_dir(workflow_id).join("variables")
    }

    fn jobs_dir(&self, workflow_id: Uuid) -> PathBuf {
        self.workflow_dir(workflow_id).join("jobs")
    }

    fn job_path(&self, key: &JobKey) -> PathBuf {
        self.jobs_dir(key.workflow_id)
            .join(format!("{}.json", key.block_id))
    }

    async fn write_json<T: Serialize + ?Sized>(
        path: &Path,
        value: &T,
    ) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(value)?;
        // Concurrent saves of one record each get their own temporary file
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
        let written = match tokio::fs::write(&tmp, content).await {
            Ok(()) => tokio::fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        written.map_err(StorageError::from)
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every `*.json` file in a directory, with its file stem
    async fn json_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, StorageError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((stem.to_string(), path.clone()));
            }
        }
        Ok(files)
    }
}

#[async_trait::async_trait]
impl WorkflowStorage for FsStorage {
    async fn save_variable(&self, variable: &Variable) -> Result<(), StorageError> {
        let path = self
            .variables_dir(variable.workflow_id)
            .join(format!("{}.json", variable.id));
        Self::write_json(&path, variable).await
    }

    async fn delete_variable(
        &self,
        workflow_id: Uuid,
        variable_id: Uuid,
    ) -> Result<(), StorageError> {
        let path = self
            .variables_dir(workflow_id)
            .join(format!("{variable_id}.json"));
        Self::remove(&path).await
    }

    async fn load_variables(&self, workflow_id: Uuid) -> Result<Vec<Variable>, StorageError> {
        let mut variables = Vec::new();
        for (_, path) in Self::json_files(&self.variables_dir(workflow_id)).await? {
            if let Some(variable) = Self::read_json::<Variable>(&path).await? {
                variables.push(variable);
            }
        }
        variables.sort_by_key(|v| v.created_at);
        Ok(variables)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError> {
        let path = self.workflow_dir(workflow.id).join("workflow.json");
        Self::write_json(&path, workflow).await
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>, StorageError> {
        let path = self.workflow_dir(workflow_id).join("workflow.json");
        Self::read_json(&path).await
    }

    async fn save_job_status(
        &self,
        key: &JobKey,
        status: &AsyncJobStatus,
    ) -> Result<(), StorageError> {
        Self::write_json(&self.job_path(key), status).await
    }

    async fn load_job_status(&self, key: &JobKey) -> Result<Option<AsyncJobStatus>, StorageError> {
        Self::read_json(&self.job_path(key)).await
    }

    async fn load_job_statuses(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(JobKey, AsyncJobStatus)>, StorageError> {
        let mut statuses = Vec::new();
        for (stem, path) in Self::json_files(&self.jobs_dir(workflow_id)).await? {
            let Ok(block_id) = Uuid::parse_str(&stem) else {
                tracing::warn!("Ignoring unexpected job file {path}", path = path.display());
                continue;
            };
            if let Some(status) = Self::read_json::<AsyncJobStatus>(&path).await? {
                statuses.push((JobKey::new(workflow_id, block_id), status));
            }
        }
        Ok(statuses)
    }

    async fn delete_job_status(&self, key: &JobKey) -> Result<(), StorageError> {
        Self::remove(&self.job_path(key)).await
    }
}
