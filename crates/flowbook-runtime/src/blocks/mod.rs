//! Block model and handlers
//!
//! A [`Block`] is one configured unit of work in a workflow. The fields every block
//! shares (id, order, name, skip flag, review status, output binding) live on [`Block`];
//! kind-specific configuration lives in the [`BlockKind`] variant. Each kind is executed
//! by one [`BlockHandler`], looked up through the [`BlockRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::client::ApiError;
use crate::execution::{BlockOutput, ExecutionContext};
use crate::interpolation::InterpolationError;
use crate::jobs::JobError;
use crate::variables::{Variable, VariableError, VariableKind, VariableStore};

mod checkpoint;
mod code;
mod messaging;
mod prompt;
mod registry;
mod research;
mod saas;
mod search;
mod table_transform;
mod web_fetch;

pub use checkpoint::{CheckpointConfig, CheckpointHandler};
pub use code::{CodeConfig, CodeHandler};
pub use messaging::{MessageChannel, MessagingConfig, MessagingHandler};
pub use prompt::{PromptConfig, PromptHandler, PromptImage};
pub use registry::BlockRegistry;
pub use research::{ResearchConfig, ResearchHandler};
pub use saas::{SaasConfig, SaasHandler, SaasProvider};
pub use search::{SearchConfig, SearchEngine, SearchHandler};
pub use table_transform::{
    FilterCondition, SaveMode, TableTransformConfig, TableTransformHandler, TransformOperation,
    TransformParams,
};
pub use web_fetch::{WebFetchConfig, WebFetchHandler};

#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    /// Missing or invalid configuration. The block was not attempted.
    #[error("{0}")]
    Validation(String),

    /// The remote call failed or returned something unusable
    #[error("{0}")]
    Remote(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Discarded response for stale request {0}")]
    StaleResponse(Uuid),

    #[error("{0}")]
    NotFound(String),
}

impl BlockError {
    /// Cancellation and stale responses stop the run without being reported as failures
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BlockError::Cancelled | BlockError::StaleResponse(_))
    }
}

impl From<VariableError> for BlockError {
    fn from(e: VariableError) -> Self {
        match e {
            VariableError::NotFound(_)
            | VariableError::RowNotFound { .. }
            | VariableError::ColumnNotFound { .. } => BlockError::NotFound(e.to_string()),
            VariableError::Storage(_) => BlockError::Remote(e.to_string()),
            _ => BlockError::Validation(e.to_string()),
        }
    }
}

impl From<ApiError> for BlockError {
    fn from(e: ApiError) -> Self {
        BlockError::Remote(e.to_string())
    }
}

impl From<InterpolationError> for BlockError {
    fn from(e: InterpolationError) -> Self {
        match e {
            InterpolationError::NotATable(_) => BlockError::NotFound(e.to_string()),
            _ => BlockError::Validation(e.to_string()),
        }
    }
}

impl From<JobError> for BlockError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Stale(request_id) => BlockError::StaleResponse(request_id),
            JobError::NotFound(_) => BlockError::NotFound(e.to_string()),
            JobError::Api(e) => BlockError::Remote(e.to_string()),
            JobError::Storage(_) | JobError::Variable(_) | JobError::SchedulerGone => {
                BlockError::Remote(e.to_string())
            }
            _ => BlockError::Validation(e.to_string()),
        }
    }
}

/// Review status of a block. Code must be approved before it can run.
#[derive(TS, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum BlockStatus {
    Approved,
    #[serde(alias = "tbd")]
    PendingReview,
}

/// Where a block writes its result
#[derive(TS, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct OutputBinding {
    pub id: Uuid,

    #[builder(setter(into))]
    pub name: String,

    #[serde(rename = "type")]
    pub kind: VariableKind,

    /// Column of a table variable; one row is appended per output value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub column_name: Option<String>,
}

impl OutputBinding {
    /// Check the binding against the store, returning the bound variable
    pub fn validate(&self, store: &VariableStore) -> Result<Variable, BlockError> {
        let variable = store.get_variable(self.id).ok_or_else(|| {
            BlockError::NotFound(format!("Output variable `{}` not found", self.name))
        })?;

        match (&self.column_name, variable.as_table()) {
            (Some(column), Some(table)) if !table.has_column(column) => {
                Err(BlockError::Validation(format!(
                    "Table `{}` has no column `{column}`",
                    variable.name
                )))
            }
            (Some(_), None) => Err(BlockError::Validation(format!(
                "Output variable `{}` is not a table",
                variable.name
            ))),
            (None, Some(_)) => Err(BlockError::Validation(format!(
                "Choose a column of table `{}` to save output to",
                variable.name
            ))),
            _ => Ok(variable),
        }
    }

    /// Write a block's output. Scalars take the text (lists joined by `delimiter`);
    /// column bindings get one appended row per non-empty value.
    pub async fn write(
        &self,
        store: &VariableStore,
        output: BlockOutput,
        delimiter: &str,
    ) -> Result<(), VariableError> {
        let values = match output {
            BlockOutput::Applied(_) => return Ok(()),
            BlockOutput::Text(text) => vec![text],
            BlockOutput::List(values) => values,
        };

        let Some(column) = &self.column_name else {
            store.update_variable(self.id, values.join(delimiter)).await?;
            return Ok(());
        };

        for value in values {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let mut row = Map::new();
            row.insert(column.clone(), Value::String(value.to_string()));
            store.add_table_row(self.id, row).await?;
        }
        Ok(())
    }
}

/// Which handler executes a block
#[derive(TS, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum BlockType {
    #[serde(rename = "agent")]
    Prompt,
    #[serde(rename = "searchagent")]
    Search,
    #[serde(rename = "webagent")]
    WebFetch,
    #[serde(rename = "codeblock")]
    Code,
    #[serde(rename = "checkin")]
    Checkpoint,
    #[serde(rename = "contact")]
    Messaging,
    TableTransform,
    #[serde(rename = "deepresearch")]
    Research,
    Apollo,
    Jira,
    Salesforce,
    Gong,
}

impl BlockType {
    pub const ALL: [BlockType; 12] = [
        BlockType::Prompt,
        BlockType::Search,
        BlockType::WebFetch,
        BlockType::Code,
        BlockType::Checkpoint,
        BlockType::Messaging,
        BlockType::TableTransform,
        BlockType::Research,
        BlockType::Apollo,
        BlockType::Jira,
        BlockType::Salesforce,
        BlockType::Gong,
    ];
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockType::Prompt => "agent",
            BlockType::Search => "searchagent",
            BlockType::WebFetch => "webagent",
            BlockType::Code => "codeblock",
            BlockType::Checkpoint => "checkin",
            BlockType::Messaging => "contact",
            BlockType::TableTransform => "tabletransform",
            BlockType::Research => "deepresearch",
            BlockType::Apollo => "apollo",
            BlockType::Jira => "jira",
            BlockType::Salesforce => "salesforce",
            BlockType::Gong => "gong",
        };
        f.write_str(name)
    }
}

/// Kind-specific block configuration, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockKind {
    #[serde(rename = "agent")]
    Prompt(PromptConfig),
    #[serde(rename = "searchagent")]
    Search(SearchConfig),
    #[serde(rename = "webagent")]
    WebFetch(WebFetchConfig),
    #[serde(rename = "codeblock")]
    Code(CodeConfig),
    #[serde(rename = "checkin")]
    Checkpoint(CheckpointConfig),
    #[serde(rename = "contact")]
    Messaging(MessagingConfig),
    TableTransform(TableTransformConfig),
    #[serde(rename = "deepresearch")]
    Research(ResearchConfig),
    Apollo(SaasConfig),
    Jira(SaasConfig),
    Salesforce(SaasConfig),
    Gong(SaasConfig),
}

impl BlockKind {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockKind::Prompt(_) => BlockType::Prompt,
            BlockKind::Search(_) => BlockType::Search,
            BlockKind::WebFetch(_) => BlockType::WebFetch,
            BlockKind::Code(_) => BlockType::Code,
            BlockKind::Checkpoint(_) => BlockType::Checkpoint,
            BlockKind::Messaging(_) => BlockType::Messaging,
            BlockKind::TableTransform(_) => BlockType::TableTransform,
            BlockKind::Research(_) => BlockType::Research,
            BlockKind::Apollo(_) => BlockType::Apollo,
            BlockKind::Jira(_) => BlockType::Jira,
            BlockKind::Salesforce(_) => BlockType::Salesforce,
            BlockKind::Gong(_) => BlockType::Gong,
        }
    }
}

/// One configured unit of work in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(default = "Uuid::new_v4")]
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Execution order key, unique within a workflow
    pub block_number: u32,

    #[builder(setter(into))]
    pub name: String,

    /// Skipped blocks are never executed, but the run advances past them
    #[serde(default)]
    #[builder(default)]
    pub skip: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub status: Option<BlockStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub output_variable: Option<OutputBinding>,

    #[serde(flatten)]
    pub kind: BlockKind,
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        self.kind.block_type()
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, BlockKind::Checkpoint(_))
    }

    fn mismatch(&self, expected: BlockType) -> BlockError {
        BlockError::Validation(format!(
            "Block `{}` is a {} block, not {expected}",
            self.name,
            self.block_type()
        ))
    }
}

/// Executes blocks of one kind
///
/// A handler returns the output to write into the block's binding, if any. Errors are
/// reported to the executor, which records them and stops the run.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError>;
}
