//! Workflows and their execution
//!
//! A [`Workflow`] is an ordered list of blocks. The [`WorkflowExecutor`] runs them one at a
//! time in ascending block number order:
//! - skipped blocks are passed over
//! - the first failing block halts the run, earlier outputs stay intact
//! - cancellation stops the run without reporting a failure
//! - checkpoints can pause the run until it is resumed right after them
//!
//! Transient per-block state (processing flags, last error) lives in [`RunState`], apart
//! from the persisted workflow and variables.

mod executor;
mod state;

pub use executor::{RunController, RunOptions, RunOutcome, RunReport, RunStart, WorkflowExecutor};
pub use state::{BlockRunState, RunState};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocks::{Block, BlockKind};
use crate::variables::VariableStore;

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("Block {0} not found")]
    BlockNotFound(Uuid),

    #[error("Block number {0} is used by more than one block")]
    DuplicateBlockNumber(u32),

    #[error("Block {block_id} has an invalid output binding: {reason}")]
    InvalidBinding { block_id: Uuid, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            blocks: Vec::new(),
        }
    }

    /// Blocks in execution order
    pub fn ordered_blocks(&self) -> Vec<&Block> {
        let mut blocks: Vec<&Block> = self.blocks.iter().collect();
        blocks.sort_by_key(|block| block.block_number);
        blocks
    }

    pub fn block(&self, id: Uuid) -> Option<&Block> {
        self.blocks.iter().find(|block| block.id == id)
    }

    pub fn next_block_number(&self) -> u32 {
        self.blocks
            .iter()
            .map(|block| block.block_number)
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Append a block after the current last one
    pub fn add_block(&mut self, name: impl Into<String>, kind: BlockKind) -> &Block {
        let block = Block::builder()
            .block_number(self.next_block_number())
            .name(name)
            .kind(kind)
            .build();
        self.blocks.push(block);
        &self.blocks[self.blocks.len() - 1]
    }

    /// Duplicate a block right after itself. Later blocks move down by one.
    pub fn copy_block(&mut self, id: Uuid) -> Result<Uuid, WorkflowError> {
        let source = self.block(id).ok_or(WorkflowError::BlockNotFound(id))?;
        let mut copy = source.clone();
        copy.id = Uuid::new_v4();
        copy.name = format!("{} (copy)", source.name);
        copy.block_number = source.block_number + 1;

        for block in &mut self.blocks {
            if block.block_number >= copy.block_number {
                block.block_number += 1;
            }
        }

        let copy_id = copy.id;
        let index = self
            .blocks
            .iter()
            .position(|block| block.id == id)
            .map_or(self.blocks.len(), |index| index + 1);
        self.blocks.insert(index, copy);
        Ok(copy_id)
    }

    pub fn delete_block(&mut self, id: Uuid) -> Result<Block, WorkflowError> {
        let index = self
            .blocks
            .iter()
            .position(|block| block.id == id)
            .ok_or(WorkflowError::BlockNotFound(id))?;
        Ok(self.blocks.remove(index))
    }

    /// Check block numbers are unique and every output binding names an existing variable
    /// Block numbers must be unique, since they define run order
    pub fn check_block_numbers(&self) -> Result<(), WorkflowError> {
        let mut numbers = HashSet::new();
        for block in &self.blocks {
            if !numbers.insert(block.block_number) {
                return Err(WorkflowError::DuplicateBlockNumber(block.block_number));
            }
        }
        Ok(())
    }

    pub fn validate(&self, store: &VariableStore) -> Result<(), WorkflowError> {
        self.check_block_numbers()?;
        for block in &self.blocks {
            if let Some(binding) = &block.output_variable {
                binding
                    .validate(store)
                    .map_err(|e| WorkflowError::InvalidBinding {
                        block_id: block.id,
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }
}
