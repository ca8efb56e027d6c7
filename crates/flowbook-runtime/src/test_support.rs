use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::execution::ExecutionContext;
use crate::storage::MemoryStorage;
use crate::variables::{Variable, VariableKind, VariableStore};

pub(crate) fn memory_store() -> Arc<VariableStore> {
    Arc::new(VariableStore::new(
        Uuid::new_v4(),
        Arc::new(MemoryStorage::new()),
    ))
}

pub(crate) async fn scalar(store: &VariableStore, name: &str, value: &str) -> Variable {
    let variable = store
        .create_variable(name, VariableKind::Scalar)
        .await
        .unwrap();
    store.update_variable(variable.id, value).await.unwrap()
}

/// Create a table variable holding `rows`. Each row may carry its own `id`.
pub(crate) async fn table(store: &VariableStore, name: &str, rows: Vec<Value>) -> Variable {
    let variable = store.create_table(name, Vec::new()).await.unwrap();
    for row in rows {
        let Value::Object(row) = row else {
            panic!("table rows must be objects");
        };
        store.add_table_row(variable.id, row).await.unwrap();
    }
    store.get_variable(variable.id).unwrap()
}

pub(crate) fn api(base_url: &str) -> ApiClient {
    ApiClient::new(base_url).unwrap()
}

pub(crate) fn context(
    base_url: &str,
    store: &Arc<VariableStore>,
    block_id: Uuid,
) -> ExecutionContext {
    ExecutionContext::builder()
        .workflow_id(store.workflow_id())
        .workflow_name("Test workflow")
        .block_id(block_id)
        .variables(store.clone())
        .api(api(base_url))
        .build()
}
