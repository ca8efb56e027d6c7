use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockStatus, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};
use crate::interpolation::InterpolationPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeConfig {
    pub language: String,
    pub code: String,
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            language: "python".to_string(),
            code: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunCodeRequest<'a> {
    language: &'a str,
    code: String,
    request_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct RunCodeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    output: String,
    #[serde(default)]
    cancelled: bool,
}

/// Runs approved code on the execution backend
pub struct CodeHandler;

#[async_trait]
impl BlockHandler for CodeHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::Code(config) = &block.kind else {
            return Err(block.mismatch(BlockType::Code));
        };

        // Blocks without a status have not been reviewed
        if block.status != Some(BlockStatus::Approved) {
            return Err(BlockError::Validation(
                "Your code needs to be approved for safety, before it can be run".to_string(),
            ));
        }
        if config.code.trim().is_empty() {
            return Err(BlockError::Validation(
                "Please enter some code to run".to_string(),
            ));
        }

        let code = context
            .interpolator(InterpolationPolicy::code())
            .interpolate(&config.code)?
            .text;

        tracing::trace!(
            "Running {language} code for block {id}",
            language = config.language,
            id = block.id
        );
        let response: RunCodeResponse = context
            .api()
            .post_json(
                "/api/run_code_local",
                &RunCodeRequest {
                    language: &config.language,
                    code,
                    request_id: context.request_id(),
                },
            )
            .await?;

        if response.cancelled {
            return Err(BlockError::Cancelled);
        }
        if !response.success {
            let output = if response.output.is_empty() {
                "Unknown error"
            } else {
                response.output.as_str()
            };
            return Err(BlockError::Remote(format!("Your code had an error\n{output}")));
        }

        if response.output.is_empty() {
            return Ok(None);
        }
        Ok(Some(BlockOutput::Text(response.output)))
    }
}
