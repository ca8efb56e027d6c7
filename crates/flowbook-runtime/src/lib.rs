//! Runtime library for Flowbook
//!
//! This crate provides the execution core for Flowbook workflows: ordered lists of
//! heterogeneous blocks (model prompts, web search, scraping, code execution, table
//! transforms, SaaS calls, human checkpoints) that share data through named variables.
//! It includes:
//!
//! - A variable store with scalar and table variables, cached in memory and persisted
//!   through a [`storage::WorkflowStorage`] implementation
//! - The `{{name}}` / `{{table.column}}` interpolation engine
//! - Block types and a registry mapping each block type to its handler
//! - A job scheduler that drives long-running remote research jobs over polling or
//!   streaming protocols
//! - The workflow executor, which runs blocks in order with skip, cancel, checkpoint
//!   and failure semantics
//! - Event emission for monitoring execution state
//!
//! # Example
//!
//! The typical flow for using this crate involves:
//! 1. Loading a [`workflow::Workflow`] and its [`variables::VariableStore`]
//! 2. Building a [`workflow::WorkflowExecutor`] with an API client and block registry
//! 3. Running the workflow and inspecting the returned [`workflow::RunReport`]
//! 4. Resuming after a checkpoint, or re-running single blocks

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for standalone logging to the terminal.
///
/// This sets up tracing to output directly to stderr with the log level
/// controlled by the `RUST_LOG` environment variable, defaulting to `info`.
///
/// # Examples
///
/// ```ignore
/// // Set RUST_LOG=flowbook_runtime=trace for trace-level logs in this crate
/// flowbook_runtime::init_tracing();
/// ```
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Same as [`init_tracing`], with a caller-chosen level used when `RUST_LOG` is unset.
pub fn init_tracing_with_default(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

pub mod blocks;
pub mod client;
pub mod config;
pub mod events;
pub mod execution;
pub mod interpolation;
pub mod jobs;
pub mod storage;
pub mod variables;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
