use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use uuid::Uuid;

use crate::execution::ExecutionResult;

/// Transient state of one block during a session. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRunState {
    pub processing: bool,
    pub error: Option<String>,
    pub output: Option<String>,
    pub last_result: Option<ExecutionResult>,
}

/// Run-scoped block state, kept apart from the persisted workflow and variables
#[derive(Debug, Default)]
pub struct RunState {
    blocks: RwLock<HashMap<Uuid, BlockRunState>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, BlockRunState>> {
        self.blocks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, BlockRunState>> {
        self.blocks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a block as processing, clearing the error of its previous attempt
    pub fn start(&self, block_id: Uuid) {
        let mut blocks = self.write();
        let state = blocks.entry(block_id).or_default();
        state.processing = true;
        state.error = None;
    }

    pub fn succeed(&self, block_id: Uuid, output: Option<String>) {
        let mut blocks = self.write();
        let state = blocks.entry(block_id).or_default();
        state.processing = false;
        state.error = None;
        if output.is_some() {
            state.output = output;
        }
        state.last_result = Some(ExecutionResult::Success);
    }

    pub fn fail(&self, block_id: Uuid, error: String) {
        let mut blocks = self.write();
        let state = blocks.entry(block_id).or_default();
        state.processing = false;
        state.error = Some(error);
        state.last_result = Some(ExecutionResult::Failure);
    }

    /// Cancelled blocks keep no error
    pub fn cancel(&self, block_id: Uuid) {
        let mut blocks = self.write();
        let state = blocks.entry(block_id).or_default();
        state.processing = false;
        state.error = None;
        state.last_result = Some(ExecutionResult::Cancelled);
    }

    pub fn block(&self, block_id: Uuid) -> BlockRunState {
        self.read().get(&block_id).cloned().unwrap_or_default()
    }

    pub fn is_processing(&self, block_id: Uuid) -> bool {
        self.read()
            .get(&block_id)
            .is_some_and(|state| state.processing)
    }

    /// Whether any block is processing
    pub fn is_running(&self) -> bool {
        self.read().values().any(|state| state.processing)
    }

    /// Forget everything, as after a reload
    pub fn clear(&self) {
        self.write().clear();
    }
}
