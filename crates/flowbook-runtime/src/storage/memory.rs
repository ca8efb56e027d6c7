use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::jobs::{AsyncJobStatus, JobKey};
use crate::storage::{StorageError, WorkflowStorage};
use crate::variables::Variable;
use crate::workflow::Workflow;

#[derive(Default)]
struct Records {
    variables: HashMap<Uuid, Vec<Variable>>,
    workflows: HashMap<Uuid, Workflow>,
    jobs: HashMap<JobKey, AsyncJobStatus>,
}

/// Storage that keeps everything in memory
///
/// Useful for tests and for runs that don't need to survive the process.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<Records>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl WorkflowStorage for MemoryStorage {
    async fn save_variable(&self, variable: &Variable) -> Result<(), StorageError> {
        let mut records = self.records();
        let variables = records.variables.entry(variable.workflow_id).or_default();
        match variables.iter_mut().find(|v| v.id == variable.id) {
            Some(existing) => *existing = variable.clone(),
            None => variables.push(variable.clone()),
        }
        Ok(())
    }

    async fn delete_variable(
        &self,
        workflow_id: Uuid,
        variable_id: Uuid,
    ) -> Result<(), StorageError> {
        if let Some(variables) = self.records().variables.get_mut(&workflow_id) {
            variables.retain(|v| v.id != variable_id);
        }
        Ok(())
    }

    async fn load_variables(&self, workflow_id: Uuid) -> Result<Vec<Variable>, StorageError> {
        Ok(self
            .records()
            .variables
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StorageError> {
        self.records()
            .workflows
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>, StorageError> {
        Ok(self.records().workflows.get(&workflow_id).cloned())
    }

    async fn save_job_status(
        &self,
        key: &JobKey,
        status: &AsyncJobStatus,
    ) -> Result<(), StorageError> {
        self.records().jobs.insert(*key, status.clone());
        Ok(())
    }

    async fn load_job_status(&self, key: &JobKey) -> Result<Option<AsyncJobStatus>, StorageError> {
        Ok(self.records().jobs.get(key).cloned())
    }

    async fn load_job_statuses(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(JobKey, AsyncJobStatus)>, StorageError> {
        Ok(self
            .records()
            .jobs
            .iter()
            .filter(|(key, _)| key.workflow_id == workflow_id)
            .map(|(key, status)| (*key, status.clone()))
            .collect())
    }

    async fn delete_job_status(&self, key: &JobKey) -> Result<(), StorageError> {
        self.records().jobs.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ResearchEngine;
    use crate::variables::VariableValue;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_replaces_existing_variable() {
        let storage = MemoryStorage::new();
        let workflow_id = Uuid::new_v4();
        let mut variable = Variable::new(workflow_id, "company", VariableValue::from("Acme"));
        storage.save_variable(&variable).await.unwrap();

        variable.value = VariableValue::from("Globex");
        storage.save_variable(&variable).await.unwrap();

        let loaded = storage.load_variables(workflow_id).await.unwrap();
        assert_eq!(loaded, vec![variable]);
    }

    #[tokio::test]
    async fn test_records_are_scoped_by_workflow() {
        let storage = MemoryStorage::new();
        let (ours, theirs) = (Uuid::new_v4(), Uuid::new_v4());
        storage
            .save_variable(&Variable::new(ours, "a", VariableValue::from("1")))
            .await
            .unwrap();
        storage
            .save_variable(&Variable::new(theirs, "b", VariableValue::from("2")))
            .await
            .unwrap();
        let key = JobKey::new(theirs, Uuid::new_v4());
        storage
            .save_job_status(&key, &AsyncJobStatus::new(ResearchEngine::Deep))
            .await
            .unwrap();

        let names: Vec<String> = storage
            .load_variables(ours)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
        assert!(storage.load_job_statuses(ours).await.unwrap().is_empty());
        assert_eq!(storage.load_job_statuses(theirs).await.unwrap().len(), 1);

        storage.delete_job_status(&key).await.unwrap();
        assert!(storage.load_job_status(&key).await.unwrap().is_none());
    }
}
