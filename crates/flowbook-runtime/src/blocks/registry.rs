use std::collections::HashMap;
use std::sync::Arc;

use crate::blocks::{
    Block, BlockError, BlockHandler, BlockType, CheckpointHandler, CodeHandler,
    MessagingHandler, PromptHandler, ResearchHandler, SaasHandler, SaasProvider, SearchHandler,
    TableTransformHandler, WebFetchHandler,
};
use crate::events::WorkflowEvent;
use crate::execution::{BlockOutput, ExecutionContext, ExecutionResult};
use crate::workflow::RunState;

/// Maps each block type to the handler that executes it
#[derive(Clone, Default)]
pub struct BlockRegistry {
    handlers: HashMap<BlockType, Arc<dyn BlockHandler>>,
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BlockRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handler for every block type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BlockType::Prompt, PromptHandler);
        registry.register(BlockType::Search, SearchHandler);
        registry.register(BlockType::WebFetch, WebFetchHandler);
        registry.register(BlockType::Code, CodeHandler);
        registry.register(BlockType::Checkpoint, CheckpointHandler);
        registry.register(BlockType::Messaging, MessagingHandler);
        registry.register(BlockType::TableTransform, TableTransformHandler);
        registry.register(BlockType::Research, ResearchHandler);
        registry.register(BlockType::Apollo, SaasHandler::new(SaasProvider::Apollo));
        registry.register(BlockType::Jira, SaasHandler::new(SaasProvider::Jira));
        registry.register(
            BlockType::Salesforce,
            SaasHandler::new(SaasProvider::Salesforce),
        );
        registry.register(BlockType::Gong, SaasHandler::new(SaasProvider::Gong));
        registry
    }

    /// Register a handler, replacing any previous one for the type
    pub fn register(&mut self, block_type: BlockType, handler: impl BlockHandler + 'static) {
        self.handlers.insert(block_type, Arc::new(handler));
    }

    pub fn handler(&self, block_type: BlockType) -> Option<Arc<dyn BlockHandler>> {
        self.handlers.get(&block_type).cloned()
    }

    /// Process one block, recording its processing flag, output or error in `state`.
    ///
    /// Never fails: errors are stored on the block's run state and reported through the
    /// returned [`ExecutionResult`].
    pub async fn process_block(
        &self,
        block: &Block,
        context: &ExecutionContext,
        state: &RunState,
    ) -> ExecutionResult {
        let workflow_id = context.workflow_id();
        let block_id = block.id;

        tracing::trace!("Processing {kind} block {id}", kind = block.block_type(), id = block_id);
        state.start(block_id);
        context
            .emit(WorkflowEvent::BlockStarted {
                workflow_id,
                block_id,
            })
            .await;

        match self.try_process(block, context).await {
            Ok(output) => {
                let delimiter = &context.config().value_delimiter;
                state.succeed(block_id, output.map(|o| o.display(delimiter)));
                context
                    .emit(WorkflowEvent::BlockFinished {
                        workflow_id,
                        block_id,
                    })
                    .await;
                ExecutionResult::Success
            }
            Err(e) if e.is_cancellation() => {
                tracing::info!("Block {name} stopped: {e}", name = block.name);
                state.cancel(block_id);
                context
                    .emit(WorkflowEvent::BlockCancelled {
                        workflow_id,
                        block_id,
                    })
                    .await;
                ExecutionResult::Cancelled
            }
            Err(e) => {
                tracing::error!("Block {name} failed: {e}", name = block.name);
                let error = e.to_string();
                state.fail(block_id, error.clone());
                context
                    .emit(WorkflowEvent::BlockFailed {
                        workflow_id,
                        block_id,
                        error,
                    })
                    .await;
                ExecutionResult::Failure
            }
        }
    }

    async fn try_process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let handler = self.handler(block.block_type()).ok_or_else(|| {
            BlockError::Validation(format!(
                "No handler registered for {} blocks",
                block.block_type()
            ))
        })?;

        let binding = block.output_variable.as_ref();
        if let Some(binding) = binding {
            binding.validate(context.variables())?;
        }

        if context.cancellation_token().is_cancelled() {
            return Err(BlockError::Cancelled);
        }
        let output = tokio::select! {
            output = handler.process(block, context) => output?,
            _ = context.cancellation_token().cancelled() => return Err(BlockError::Cancelled),
        };

        if let (Some(binding), Some(output)) = (binding, &output) {
            binding
                .write(
                    context.variables(),
                    output.clone(),
                    &context.config().value_delimiter,
                )
                .await?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockKind, CheckpointConfig, OutputBinding};
    use crate::events::MemoryEventBus;
    use crate::test_support::{api, context, memory_store, scalar};
    use crate::variables::VariableKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Fixed(Result<Option<BlockOutput>, fn() -> BlockError>);

    #[async_trait]
    impl BlockHandler for Fixed {
        async fn process(
            &self,
            _block: &Block,
            _context: &ExecutionContext,
        ) -> Result<Option<BlockOutput>, BlockError> {
            match &self.0 {
                Ok(output) => Ok(output.clone()),
                Err(error) => Err(error()),
            }
        }
    }

    fn checkpoint_block() -> Block {
        Block::builder()
            .block_number(1)
            .name("Check in")
            .kind(BlockKind::Checkpoint(CheckpointConfig::default()))
            .build()
    }

    #[test]
    fn test_defaults_cover_every_type() {
        let registry = BlockRegistry::with_defaults();
        for block_type in BlockType::ALL {
            assert!(registry.handler(block_type).is_some(), "{block_type}");
        }
    }

    #[tokio::test]
    async fn test_output_written_to_binding() {
        let store = memory_store();
        let summary = scalar(&store, "summary", "").await;
        let mut block = checkpoint_block();
        block.output_variable = Some(
            OutputBinding::builder()
                .id(summary.id)
                .name("summary")
                .kind(VariableKind::Scalar)
                .build(),
        );

        let mut registry = BlockRegistry::new();
        registry.register(
            BlockType::Checkpoint,
            Fixed(Ok(Some(BlockOutput::Text("all good".into())))),
        );
        let state = RunState::new();
        let events = Arc::new(MemoryEventBus::new());
        let context = ExecutionContext::builder()
            .workflow_id(store.workflow_id())
            .block_id(block.id)
            .variables(store.clone())
            .api(api("http://127.0.0.1:1"))
            .event_bus(events.clone())
            .build();

        let result = registry.process_block(&block, &context, &state).await;

        assert_eq!(result, ExecutionResult::Success);
        assert_eq!(
            store.get_variable(summary.id).unwrap().as_scalar(),
            Some("all good")
        );
        let block_state = state.block(block.id);
        assert!(!block_state.processing);
        assert_eq!(block_state.output.as_deref(), Some("all good"));
        assert_eq!(
            events.events(),
            vec![
                WorkflowEvent::BlockStarted {
                    workflow_id: context.workflow_id(),
                    block_id: block.id
                },
                WorkflowEvent::BlockFinished {
                    workflow_id: context.workflow_id(),
                    block_id: block.id
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_errors_are_recorded_not_raised() {
        let store = memory_store();
        let block = checkpoint_block();
        let mut registry = BlockRegistry::new();
        registry.register(
            BlockType::Checkpoint,
            Fixed(Err(|| BlockError::Remote("backend exploded".into()))),
        );
        let state = RunState::new();
        let context = context("http://127.0.0.1:1", &store, block.id);

        let result = registry.process_block(&block, &context, &state).await;

        assert_eq!(result, ExecutionResult::Failure);
        assert_eq!(state.block(block.id).error.as_deref(), Some("backend exploded"));
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let store = memory_store();
        let block = checkpoint_block();
        let mut registry = BlockRegistry::new();
        registry.register(BlockType::Checkpoint, Fixed(Err(|| BlockError::Cancelled)));
        let state = RunState::new();
        let context = context("http://127.0.0.1:1", &store, block.id);

        let result = registry.process_block(&block, &context, &state).await;

        assert_eq!(result, ExecutionResult::Cancelled);
        assert!(state.block(block.id).error.is_none());
    }

    #[tokio::test]
    async fn test_missing_handler_fails_block() {
        let store = memory_store();
        let block = checkpoint_block();
        let state = RunState::new();
        let context = context("http://127.0.0.1:1", &store, block.id);

        let result = BlockRegistry::new()
            .process_block(&block, &context, &state)
            .await;

        assert_eq!(result, ExecutionResult::Failure);
        assert!(state
            .block(block.id)
            .error
            .unwrap()
            .contains("No handler registered"));
    }
}
