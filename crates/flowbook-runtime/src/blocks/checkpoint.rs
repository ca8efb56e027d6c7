use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Note included in the check-in notification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Sends a check-in notification. Pausing the run is up to the executor.
pub struct CheckpointHandler;

#[async_trait]
impl BlockHandler for CheckpointHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::Checkpoint(config) = &block.kind else {
            return Err(block.mismatch(BlockType::Checkpoint));
        };

        let message = match &config.message {
            Some(message) => Some(
                context
                    .interpolator(context.text_policy())
                    .interpolate(message)?
                    .text,
            ),
            None => None,
        };

        if let Err(e) = context
            .notifier()
            .checkpoint_reached(
                context.workflow_id(),
                context.workflow_name(),
                &block.name,
                message.as_deref(),
            )
            .await
        {
            tracing::warn!("Failed to send check-in for block {name}: {e}", name = block.name);
        }

        Ok(None)
    }
}
