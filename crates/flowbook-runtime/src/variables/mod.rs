//! Workflow variables
//!
//! Variables are the data shared between blocks. A variable is either a scalar (a single
//! string) or a table (ordered rows of column/value pairs).
//!
//! The [`VariableStore`] keeps every variable of one workflow in an in-memory cache.
//! Mutations update the cache before they are written to durable storage, so a value
//! written by one block is visible to interpolation immediately afterwards. Writes are
//! serialized, so storage always receives snapshots in the order the cache took them.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use uuid::Uuid;

use crate::storage::{StorageError, WorkflowStorage};

#[derive(thiserror::Error, Debug)]
pub enum VariableError {
    #[error("Variable not found: {0}")]
    NotFound(String),

    #[error("Row {row_id} not found in table `{table}`")]
    RowNotFound { table: String, row_id: String },

    #[error("A variable named `{0}` already exists")]
    DuplicateName(String),

    #[error("Variable `{name}` is a {actual}, expected a {expected}")]
    WrongKind {
        name: String,
        expected: VariableKind,
        actual: VariableKind,
    },

    #[error("Table `{table}` has no column `{column}`")]
    ColumnNotFound { table: String, column: String },

    #[error("Variable names cannot be empty")]
    EmptyName,

    #[error("Failed to persist variable: {0}")]
    Storage(#[from] StorageError),
}

#[derive(TS, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum VariableKind {
    Scalar,
    Table,
}

impl std::fmt::Display for VariableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariableKind::Scalar => write!(f, "scalar"),
            VariableKind::Table => write!(f, "table"),
        }
    }
}

/// A single row of a table variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub id: String,
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

impl TableRow {
    pub fn get(&self, column: &str) -> Option<String> {
        self.columns.get(column).map(value_to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableData {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

impl TableData {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    fn merge_columns<'a>(&mut self, names: impl Iterator<Item = &'a String>) {
        for name in names {
            if !self.has_column(name) {
                self.columns.push(name.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum VariableValue {
    Scalar(String),
    Table(TableData),
}

impl VariableValue {
    pub fn kind(&self) -> VariableKind {
        match self {
            VariableValue::Scalar(_) => VariableKind::Scalar,
            VariableValue::Table(_) => VariableKind::Table,
        }
    }

    pub fn empty(kind: VariableKind) -> Self {
        match kind {
            VariableKind::Scalar => VariableValue::Scalar(String::new()),
            VariableKind::Table => VariableValue::Table(TableData::default()),
        }
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::Scalar(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Scalar(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: Uuid,
    pub name: String,
    pub workflow_id: Uuid,
    #[serde(flatten)]
    pub value: VariableValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Variable {
    pub fn new(workflow_id: Uuid, name: impl Into<String>, value: VariableValue) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            workflow_id,
            value,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> VariableKind {
        self.value.kind()
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match &self.value {
            VariableValue::Scalar(value) => Some(value),
            VariableValue::Table(_) => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableData> {
        match &self.value {
            VariableValue::Table(table) => Some(table),
            VariableValue::Scalar(_) => None,
        }
    }

    fn as_table_mut(&mut self) -> Result<&mut TableData, VariableError> {
        let actual = self.kind();
        match &mut self.value {
            VariableValue::Table(table) => Ok(table),
            VariableValue::Scalar(_) => Err(VariableError::WrongKind {
                name: self.name.clone(),
                expected: VariableKind::Table,
                actual,
            }),
        }
    }
}

/// Coerce a cell value to the string used for interpolation
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// In-memory cache of one workflow's variables, backed by durable storage
pub struct VariableStore {
    workflow_id: Uuid,
    cache: RwLock<Vec<Variable>>,
    storage: Arc<dyn WorkflowStorage>,
    /// Held from a cache change until its snapshot is stored
    writes: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableStore")
            .field("workflow_id", &self.workflow_id)
            .field("variables", &self.read().len())
            .finish()
    }
}

impl VariableStore {
    /// Create an empty store. Use [`VariableStore::load`] to start from persisted state.
    pub fn new(workflow_id: Uuid, storage: Arc<dyn WorkflowStorage>) -> Self {
        Self {
            workflow_id,
            cache: RwLock::new(Vec::new()),
            storage,
            writes: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(
        workflow_id: Uuid,
        storage: Arc<dyn WorkflowStorage>,
    ) -> Result<Self, VariableError> {
        let store = Self::new(workflow_id, storage);
        store.reload().await?;
        Ok(store)
    }

    /// Replace the whole cache with the persisted variables of this workflow
    pub async fn reload(&self) -> Result<(), VariableError> {
        let _writes = self.writes.lock().await;
        let variables = self.storage.load_variables(self.workflow_id).await?;
        tracing::debug!(
            "Reloaded {count} variables for workflow {workflow_id}",
            count = variables.len(),
            workflow_id = self.workflow_id
        );
        *self.write() = variables;
        Ok(())
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.read().clone()
    }

    pub fn get_variable(&self, id: Uuid) -> Option<Variable> {
        self.read().iter().find(|v| v.id == id).cloned()
    }

    /// First variable with the given name
    pub fn get_variable_by_name(&self, name: &str) -> Option<Variable> {
        self.read().iter().find(|v| v.name == name).cloned()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.read().iter().any(|v| v.name == name)
    }

    pub async fn create_variable(
        &self,
        name: impl Into<String>,
        kind: VariableKind,
    ) -> Result<Variable, VariableError> {
        self.insert(name.into(), VariableValue::empty(kind)).await
    }

    pub async fn create_table(
        &self,
        name: impl Into<String>,
        columns: Vec<String>,
    ) -> Result<Variable, VariableError> {
        let mut table = TableData::default();
        table.merge_columns(columns.iter());
        self.insert(name.into(), VariableValue::Table(table)).await
    }

    /// Return the variable with this name, creating it if it does not exist yet
    pub async fn ensure_variable(
        &self,
        name: &str,
        kind: VariableKind,
    ) -> Result<Variable, VariableError> {
        match self.get_variable_by_name(name) {
            Some(existing) if existing.kind() == kind => Ok(existing),
            Some(existing) => Err(VariableError::WrongKind {
                actual: existing.kind(),
                name: existing.name,
                expected: kind,
            }),
            None => self.create_variable(name, kind).await,
        }
    }

    async fn insert(&self, name: String, value: VariableValue) -> Result<Variable, VariableError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(VariableError::EmptyName);
        }

        let _writes = self.writes.lock().await;
        let variable = {
            let mut cache = self.write();
            if cache.iter().any(|v| v.name == name) {
                return Err(VariableError::DuplicateName(name));
            }
            let variable = Variable::new(self.workflow_id, name, value);
            cache.push(variable.clone());
            variable
        };

        tracing::debug!(
            "Created {kind} variable {name}",
            kind = variable.kind(),
            name = variable.name
        );
        self.persist(&variable).await?;
        Ok(variable)
    }

    /// Replace a variable's value. The new value must be of the same kind.
    pub async fn update_variable(
        &self,
        id: Uuid,
        value: impl Into<VariableValue>,
    ) -> Result<Variable, VariableError> {
        let value = value.into();
        let _writes = self.writes.lock().await;
        let (variable, _) = self.mutate(id, |variable| {
            if variable.kind() != value.kind() {
                return Err(VariableError::WrongKind {
                    name: variable.name.clone(),
                    expected: variable.kind(),
                    actual: value.kind(),
                });
            }
            variable.value = value;
            Ok(())
        })?;
        self.persist(&variable).await?;
        Ok(variable)
    }

    pub async fn rename_variable(
        &self,
        id: Uuid,
        name: impl Into<String>,
    ) -> Result<Variable, VariableError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(VariableError::EmptyName);
        }
        let _writes = self.writes.lock().await;
        if self.read().iter().any(|v| v.name == name && v.id != id) {
            return Err(VariableError::DuplicateName(name));
        }

        let (variable, _) = self.mutate(id, |variable| {
            variable.name = name;
            Ok(())
        })?;
        self.persist(&variable).await?;
        Ok(variable)
    }

    pub async fn delete_variable(&self, id: Uuid) -> Result<Variable, VariableError> {
        let _writes = self.writes.lock().await;
        let removed = {
            let mut cache = self.write();
            let index = cache
                .iter()
                .position(|v| v.id == id)
                .ok_or_else(|| VariableError::NotFound(id.to_string()))?;
            cache.remove(index)
        };

        self.storage
            .delete_variable(self.workflow_id, removed.id)
            .await?;
        Ok(removed)
    }

    pub async fn add_table_column(
        &self,
        table_id: Uuid,
        column: impl Into<String>,
    ) -> Result<Variable, VariableError> {
        let column = column.into();
        let _writes = self.writes.lock().await;
        let (variable, _) = self.mutate(table_id, |variable| {
            variable.as_table_mut()?.merge_columns(std::iter::once(&column));
            Ok(())
        })?;
        self.persist(&variable).await?;
        Ok(variable)
    }

    /// Append a row. Unknown columns are added to the table; an `id` entry in the
    /// partial row is used as the row id, otherwise one is generated.
    pub async fn add_table_row(
        &self,
        table_id: Uuid,
        mut partial: Map<String, Value>,
    ) -> Result<TableRow, VariableError> {
        let row_id = match partial.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        let _writes = self.writes.lock().await;
        let (variable, row) = self.mutate(table_id, |variable| {
            let table = variable.as_table_mut()?;
            table.merge_columns(partial.keys());
            let row = TableRow {
                id: row_id,
                columns: partial,
            };
            table.rows.push(row.clone());
            Ok(row)
        })?;
        self.persist(&variable).await?;
        Ok(row)
    }

    /// Merge columns into an existing row
    pub async fn update_table_row(
        &self,
        table_id: Uuid,
        row_id: &str,
        partial: Map<String, Value>,
    ) -> Result<TableRow, VariableError> {
        let _writes = self.writes.lock().await;
        let (variable, row) = self.mutate(table_id, |variable| {
            let name = variable.name.clone();
            let table = variable.as_table_mut()?;
            table.merge_columns(partial.keys().filter(|k| k.as_str() != "id"));
            let row = table
                .rows
                .iter_mut()
                .find(|r| r.id == row_id)
                .ok_or_else(|| VariableError::RowNotFound {
                    table: name,
                    row_id: row_id.to_string(),
                })?;
            for (column, value) in partial {
                if column != "id" {
                    row.columns.insert(column, value);
                }
            }
            Ok(row.clone())
        })?;
        self.persist(&variable).await?;
        Ok(row)
    }

    /// Apply a change to the cached variable, returning a snapshot to persist. Callers
    /// hold `writes` until the snapshot is stored.
    fn mutate<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Variable) -> Result<T, VariableError>,
    ) -> Result<(Variable, T), VariableError> {
        let mut cache = self.write();
        let variable = cache
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| VariableError::NotFound(id.to_string()))?;
        let result = f(variable)?;
        variable.updated_at = Utc::now();
        Ok((variable.clone(), result))
    }

    async fn persist(&self, variable: &Variable) -> Result<(), VariableError> {
        // The cache keeps the new value even if the write fails.
        if let Err(e) = self.storage.save_variable(variable).await {
            tracing::warn!(
                "Failed to persist variable {name}: {e}",
                name = variable.name
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Variable>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Variable>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn store() -> (VariableStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (VariableStore::new(Uuid::new_v4(), storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_create_and_lookup_by_name() {
        let (store, _) = store();
        let company = store
            .create_variable("company", VariableKind::Scalar)
            .await
            .unwrap();

        let found = store.get_variable_by_name("company").unwrap();
        assert_eq!(found.id, company.id);
        assert_eq!(found.as_scalar(), Some(""));
        assert!(store.get_variable_by_name("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let (store, _) = store();
        store
            .create_variable("company", VariableKind::Scalar)
            .await
            .unwrap();

        let err = store
            .create_variable("company", VariableKind::Table)
            .await
            .unwrap_err();
        assert!(matches!(err, VariableError::DuplicateName(name) if name == "company"));
    }

    #[tokio::test]
    async fn test_rename_to_existing_name_rejected() {
        let (store, _) = store();
        store.create_variable("a", VariableKind::Scalar).await.unwrap();
        let b = store.create_variable("b", VariableKind::Scalar).await.unwrap();

        assert!(matches!(
            store.rename_variable(b.id, "a").await,
            Err(VariableError::DuplicateName(_))
        ));
        let renamed = store.rename_variable(b.id, "c").await.unwrap();
        assert_eq!(renamed.name, "c");
    }

    #[tokio::test]
    async fn test_update_is_visible_synchronously_and_persisted() {
        let (store, storage) = store();
        let var = store
            .create_variable("company", VariableKind::Scalar)
            .await
            .unwrap();

        store.update_variable(var.id, "Acme").await.unwrap();
        assert_eq!(
            store.get_variable_by_name("company").unwrap().as_scalar(),
            Some("Acme")
        );

        let persisted = storage.load_variables(store.workflow_id()).await.unwrap();
        assert_eq!(persisted[0].as_scalar(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let (store, _) = store();
        let err = store.update_variable(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, VariableError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_kind_change() {
        let (store, _) = store();
        let table = store.create_table("leads", vec![]).await.unwrap();
        let err = store.update_variable(table.id, "oops").await.unwrap_err();
        assert!(matches!(err, VariableError::WrongKind { .. }));
    }

    #[tokio::test]
    async fn test_add_table_row_generates_id_and_merges_columns() {
        let (store, _) = store();
        let table = store
            .create_table("leads", vec!["name".to_string()])
            .await
            .unwrap();

        let first = store
            .add_table_row(table.id, row(json!({"name": "Bob", "email": "bob@example.com"})))
            .await
            .unwrap();
        let second = store
            .add_table_row(table.id, row(json!({"id": "r2", "name": "Alice"})))
            .await
            .unwrap();

        assert!(!first.id.is_empty());
        assert_eq!(second.id, "r2");

        let data = store.get_variable(table.id).unwrap().as_table().cloned().unwrap();
        assert_eq!(data.columns, vec!["name".to_string(), "email".to_string()]);
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[1].get("name").as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_update_table_row_merges() {
        let (store, _) = store();
        let table = store.create_table("leads", vec![]).await.unwrap();
        store
            .add_table_row(table.id, row(json!({"id": "r1", "name": "Bob"})))
            .await
            .unwrap();

        let updated = store
            .update_table_row(table.id, "r1", row(json!({"summary": "CEO"})))
            .await
            .unwrap();

        assert_eq!(updated.get("name").as_deref(), Some("Bob"));
        assert_eq!(updated.get("summary").as_deref(), Some("CEO"));
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let (store, _) = store();
        let table = store.create_table("leads", vec![]).await.unwrap();

        let err = store
            .update_table_row(table.id, "nope", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VariableError::RowNotFound { .. }));

        let err = store
            .update_table_row(Uuid::new_v4(), "nope", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VariableError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_row_operations_require_table() {
        let (store, _) = store();
        let scalar = store
            .create_variable("company", VariableKind::Scalar)
            .await
            .unwrap();
        let err = store.add_table_row(scalar.id, Map::new()).await.unwrap_err();
        assert!(matches!(err, VariableError::WrongKind { .. }));
    }

    #[tokio::test]
    async fn test_ensure_variable() {
        let (store, _) = store();
        let created = store
            .ensure_variable("notes", VariableKind::Scalar)
            .await
            .unwrap();
        let again = store
            .ensure_variable("notes", VariableKind::Scalar)
            .await
            .unwrap();
        assert_eq!(created.id, again.id);

        assert!(matches!(
            store.ensure_variable("notes", VariableKind::Table).await,
            Err(VariableError::WrongKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_and_reload() {
        let (store, storage) = store();
        let a = store.create_variable("a", VariableKind::Scalar).await.unwrap();
        store.create_variable("b", VariableKind::Scalar).await.unwrap();
        store.delete_variable(a.id).await.unwrap();

        let reloaded = VariableStore::load(store.workflow_id(), storage).await.unwrap();
        let names: Vec<String> = reloaded.variables().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    /// Memory storage that is slow to save the scalar value "A"
    #[derive(Default)]
    struct SlowStorage {
        inner: MemoryStorage,
    }

    #[async_trait::async_trait]
    impl WorkflowStorage for SlowStorage {
        async fn save_variable(&self, variable: &Variable) -> Result<(), StorageError> {
            if variable.as_scalar() == Some("A") {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            self.inner.save_variable(variable).await
        }

        async fn delete_variable(&self, workflow_id: Uuid, id: Uuid) -> Result<(), StorageError> {
            self.inner.delete_variable(workflow_id, id).await
        }

        async fn load_variables(&self, workflow_id: Uuid) -> Result<Vec<Variable>, StorageError> {
            self.inner.load_variables(workflow_id).await
        }

        async fn save_workflow(
            &self,
            workflow: &crate::workflow::Workflow,
        ) -> Result<(), StorageError> {
            self.inner.save_workflow(workflow).await
        }

        async fn load_workflow(
            &self,
            workflow_id: Uuid,
        ) -> Result<Option<crate::workflow::Workflow>, StorageError> {
            self.inner.load_workflow(workflow_id).await
        }

        async fn save_job_status(
            &self,
            key: &crate::jobs::JobKey,
            status: &crate::jobs::AsyncJobStatus,
        ) -> Result<(), StorageError> {
            self.inner.save_job_status(key, status).await
        }

        async fn load_job_status(
            &self,
            key: &crate::jobs::JobKey,
        ) -> Result<Option<crate::jobs::AsyncJobStatus>, StorageError> {
            self.inner.load_job_status(key).await
        }

        async fn load_job_statuses(
            &self,
            workflow_id: Uuid,
        ) -> Result<Vec<(crate::jobs::JobKey, crate::jobs::AsyncJobStatus)>, StorageError> {
            self.inner.load_job_statuses(workflow_id).await
        }

        async fn delete_job_status(&self, key: &crate::jobs::JobKey) -> Result<(), StorageError> {
            self.inner.delete_job_status(key).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_updates_reach_storage_in_order() {
        let storage = Arc::new(SlowStorage::default());
        let store = Arc::new(VariableStore::new(Uuid::new_v4(), storage.clone()));
        let var = store
            .create_variable("company", VariableKind::Scalar)
            .await
            .unwrap();

        let slow = tokio::spawn({
            let store = store.clone();
            async move { store.update_variable(var.id, "A").await }
        });
        while store.get_variable(var.id).unwrap().as_scalar() != Some("A") {
            tokio::task::yield_now().await;
        }
        store.update_variable(var.id, "B").await.unwrap();
        slow.await.unwrap().unwrap();

        let persisted = storage.load_variables(store.workflow_id()).await.unwrap();
        assert_eq!(persisted[0].as_scalar(), Some("B"));

        store.reload().await.unwrap();
        assert_eq!(store.get_variable(var.id).unwrap().as_scalar(), Some("B"));
    }

    #[test]
    fn test_variable_serialization_shape() {
        let var = Variable::new(Uuid::new_v4(), "company", "Acme".into());
        let json = serde_json::to_value(&var).unwrap();
        assert_eq!(json["type"], "scalar");
        assert_eq!(json["value"], "Acme");
        assert_eq!(json["name"], "company");

        let back: Variable = serde_json::from_value(json).unwrap();
        assert_eq!(back, var);
    }
}
