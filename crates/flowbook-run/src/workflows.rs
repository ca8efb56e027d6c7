use std::path::{Path, PathBuf};

use flowbook_runtime::variables::{TableData, Variable, VariableKind, VariableValue};
use flowbook_runtime::workflow::Workflow;
use serde::Deserialize;
use uuid::Uuid;

type Result<T> = std::result::Result<T, WorkflowFileError>;

#[derive(thiserror::Error, Debug)]
pub enum WorkflowFileError {
    #[error("Failed to read workflow file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Invalid workflow file {0}: {1}")]
    InvalidWorkflowFile(PathBuf, String),
}

/// A variable declared by the workflow file, created on first run
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VariableSeed {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl VariableSeed {
    pub fn to_variable(&self, workflow_id: Uuid) -> Variable {
        let value = match self.kind {
            VariableKind::Scalar => VariableValue::empty(VariableKind::Scalar),
            VariableKind::Table => VariableValue::Table(TableData {
                columns: self.columns.clone(),
                rows: Vec::new(),
            }),
        };
        Variable {
            id: self.id,
            ..Variable::new(workflow_id, self.name.clone(), value)
        }
    }
}

pub struct WorkflowFile {
    pub workflow: Workflow,
    pub variables: Vec<VariableSeed>,
}

pub async fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowFile> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    // YAML is a superset of JSON, so one parser covers both
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let json_value: serde_json::Value = serde_yaml::from_value(yaml_value)?;
    load_workflow_from_json_value(json_value, path)
}

fn load_workflow_from_json_value(
    mut json_value: serde_json::Value,
    path: impl AsRef<Path>,
) -> Result<WorkflowFile> {
    let invalid = |reason: &str| {
        WorkflowFileError::InvalidWorkflowFile(path.as_ref().to_path_buf(), reason.to_string())
    };

    // Variables and job records are keyed by workflow id, so it has to be stable
    json_value
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| invalid("id not found or not a valid UUID"))?;

    if !json_value.get("blocks").is_some_and(|v| v.is_array()) {
        return Err(invalid("blocks not found or not an array"));
    }

    let variables = match json_value
        .as_object_mut()
        .and_then(|object| object.remove("variables"))
    {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };
    let workflow: Workflow = serde_json::from_value(json_value)?;

    Ok(WorkflowFile {
        workflow,
        variables,
    })
}
