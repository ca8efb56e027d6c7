use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformOperation {
    #[default]
    Deduplicate,
    Filter,
}

impl TransformOperation {
    fn wire_name(self) -> &'static str {
        match self {
            TransformOperation::Deduplicate => "dedupe",
            TransformOperation::Filter => "filter",
        }
    }

    fn default_table_name(self, table_id: Uuid) -> String {
        match self {
            TransformOperation::Deduplicate => format!("deduplicated_{table_id}"),
            TransformOperation::Filter => format!("filtered_{table_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Replace the source table
    Overwrite,
    /// Write the result to a new table
    #[default]
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformParams {
    /// Columns compared when deduplicating
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subset_columns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableTransformConfig {
    pub table_id: Option<Uuid>,
    pub operation: TransformOperation,
    pub params: TransformParams,
    pub save_mode: SaveMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_table_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransformRequest<'a> {
    request_id: Uuid,
    user_id: String,
    agent_id: Uuid,
    table_id: Uuid,
    operation: &'static str,
    params: TransformRequestParams<'a>,
    save_mode: SaveMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_table_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TransformRequestParams<'a> {
    Dedupe { subset_columns: &'a [String] },
    Filter { conditions: &'a [FilterCondition] },
}

#[derive(Debug, Deserialize)]
struct TransformResponse {
    status: String,
    message: Option<String>,
    error: Option<String>,
}

/// Deduplicates or filters a table on the backend, then reloads the variable store
pub struct TableTransformHandler;

impl TableTransformHandler {
    fn params(config: &TableTransformConfig) -> Result<TransformRequestParams<'_>, BlockError> {
        match config.operation {
            TransformOperation::Deduplicate if config.params.subset_columns.is_empty() => {
                Err(BlockError::Validation(
                    "Please select at least one column to deduplicate on".to_string(),
                ))
            }
            TransformOperation::Deduplicate => Ok(TransformRequestParams::Dedupe {
                subset_columns: &config.params.subset_columns,
            }),
            TransformOperation::Filter if config.params.conditions.is_empty() => Err(
                BlockError::Validation("Please add at least one filter condition".to_string()),
            ),
            TransformOperation::Filter => Ok(TransformRequestParams::Filter {
                conditions: &config.params.conditions,
            }),
        }
    }
}

#[async_trait]
impl BlockHandler for TableTransformHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::TableTransform(config) = &block.kind else {
            return Err(block.mismatch(BlockType::TableTransform));
        };
        let table_id = config
            .table_id
            .ok_or_else(|| BlockError::Validation("No table selected".to_string()))?;
        let table = context
            .variables()
            .get_variable(table_id)
            .filter(|v| v.as_table().is_some())
            .ok_or_else(|| BlockError::NotFound(format!("Table {table_id} not found")))?;
        let params = Self::params(config)?;

        let new_table_name = match config.save_mode {
            SaveMode::New => Some(
                config
                    .new_table_name
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| config.operation.default_table_name(table_id)),
            ),
            SaveMode::Overwrite => None,
        };

        let request = TransformRequest {
            request_id: context.request_id(),
            user_id: context.workflow_id().to_string(),
            agent_id: context.workflow_id(),
            table_id,
            operation: config.operation.wire_name(),
            params,
            save_mode: config.save_mode,
            new_table_name,
        };
        let response: TransformResponse = context
            .api()
            .post_json("/api/table-transform", &request)
            .await?;

        if response.status != "success" {
            return Err(BlockError::Remote(
                response
                    .message
                    .or(response.error)
                    .unwrap_or_else(|| "Failed to transform table".to_string()),
            ));
        }

        // The backend writes tables directly, so pick up whatever it created or replaced
        context.variables().reload().await?;
        tracing::info!(
            "Transformed table {name} ({operation:?})",
            name = table.name,
            operation = config.operation
        );

        let summary = match &request.new_table_name {
            Some(name) => format!("Saved {} of `{}` to `{name}`", request.operation, table.name),
            None => format!("Overwrote `{}` ({})", table.name, request.operation),
        };
        Ok(Some(BlockOutput::Applied(summary)))
    }
}
