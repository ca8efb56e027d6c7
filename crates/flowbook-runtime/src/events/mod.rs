//! Event system for runtime monitoring
//!
//! This module provides an event bus abstraction for monitoring workflow execution.
//! Events cover run state changes, block lifecycle and async job status changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::jobs::JobState;

/// Events emitted by the runtime for monitoring and UI updates
#[derive(TS, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[ts(tag = "type", content = "data", export)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// A run started
    RunStarted { workflow_id: Uuid },

    /// Every remaining block of a run succeeded or was skipped
    RunCompleted { workflow_id: Uuid },

    /// A run stopped after a checkpoint block, waiting to be resumed
    RunPaused { workflow_id: Uuid, block_id: Uuid },

    /// A run stopped at a failing block
    RunFailed {
        workflow_id: Uuid,
        block_id: Uuid,
        error: String,
    },

    /// A run was cancelled
    RunCancelled { workflow_id: Uuid },

    /// Block execution started
    BlockStarted { workflow_id: Uuid, block_id: Uuid },

    /// Block was skipped because its skip flag is set
    BlockSkipped { workflow_id: Uuid, block_id: Uuid },

    /// Block execution finished successfully
    BlockFinished { workflow_id: Uuid, block_id: Uuid },

    /// Block execution failed
    BlockFailed {
        workflow_id: Uuid,
        block_id: Uuid,
        error: String,
    },

    /// Block execution was cancelled
    BlockCancelled { workflow_id: Uuid, block_id: Uuid },

    /// The async job owned by a block changed status
    JobStatusChanged {
        workflow_id: Uuid,
        block_id: Uuid,
        status: JobState,
    },
}

/// Trait for emitting events from the runtime
///
/// Implementations of this trait handle the delivery of runtime events
/// to monitoring systems, logs, or other consumers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Emit an event to the event bus
    ///
    /// # Errors
    /// Returns an error if the event cannot be emitted
    async fn emit(
        &self,
        event: WorkflowEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// No-op event bus for when events are not needed
pub struct NoOpEventBus;

#[async_trait]
impl EventBus for NoOpEventBus {
    async fn emit(
        &self,
        _event: WorkflowEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Event bus that collects events in memory
///
/// Useful for testing or scenarios where events need to be collected
/// and inspected programmatically.
#[derive(Default)]
pub struct MemoryEventBus {
    events: std::sync::Mutex<Vec<WorkflowEvent>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn emit(
        &self,
        event: WorkflowEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events
            .lock()
            .map_err(|_| "event buffer poisoned")?
            .push(event);
        Ok(())
    }
}
