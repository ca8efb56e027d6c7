use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};
use crate::jobs::ResearchEngine;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub topic: String,
    pub engine: ResearchEngine,
}

/// Starts a long-running research job for the block.
///
/// The block succeeds as soon as the job is accepted. Results arrive later through the
/// job scheduler and are saved to variables only when the operator selects them.
pub struct ResearchHandler;

#[async_trait]
impl BlockHandler for ResearchHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::Research(config) = &block.kind else {
            return Err(block.mismatch(BlockType::Research));
        };

        let topic = context
            .interpolator(context.text_policy())
            .interpolate(&config.topic)?
            .text;
        if topic.trim().is_empty() {
            return Err(BlockError::Validation(
                "Please enter a research topic".to_string(),
            ));
        }

        let jobs = context
            .jobs()
            .ok_or_else(|| BlockError::Validation("Research jobs are not available".to_string()))?;

        let status = jobs
            .start(context.job_key(), config.engine, topic.trim())
            .await?;
        tracing::info!(
            "Started {engine:?} research for block {name} (request {request:?})",
            engine = config.engine,
            name = block.name,
            request = status.request_id
        );

        Ok(None)
    }
}
