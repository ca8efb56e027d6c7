use std::sync::{Arc, Mutex};

use serde::Serialize;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::blocks::{Block, BlockRegistry};
use crate::client::{ApiClient, ApiError, NoOpNotifier, RunNotifier};
use crate::config::RuntimeConfig;
use crate::events::{EventBus, WorkflowEvent};
use crate::execution::{CancellationToken, ExecutionContext, ExecutionResult};
use crate::jobs::JobSchedulerHandle;
use crate::variables::VariableStore;
use crate::workflow::{RunState, Workflow, WorkflowError};

/// Where a run begins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunStart {
    #[default]
    Beginning,
    /// Position in execution order
    Index(usize),
    /// Right after the given block, typically the checkpoint a run paused at
    AfterBlock(Uuid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub start: RunStart,
    pub pause_at_checkpoints: bool,
}

impl RunOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            start: RunStart::Beginning,
            pause_at_checkpoints: config.pause_at_checkpoints,
        }
    }

    pub fn starting_at(mut self, start: RunStart) -> Self {
        self.start = start;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunOutcome {
    /// Every remaining block succeeded or was skipped
    Completed,
    Failed { block_id: Uuid, error: String },
    /// Stopped by the operator before or while running `block_id`
    Cancelled { block_id: Option<Uuid> },
    /// Stopped after a checkpoint. Resume with [`RunStart::AfterBlock`].
    Paused { block_id: Uuid },
}

/// What happened during one run invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub workflow_id: Uuid,
    /// Blocks whose handler was invoked, in order
    pub attempted: Vec<Uuid>,
    pub succeeded: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub outcome: RunOutcome,
}

impl RunReport {
    fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            attempted: Vec::new(),
            succeeded: Vec::new(),
            skipped: Vec::new(),
            outcome: RunOutcome::Completed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed | RunOutcome::Paused { .. })
    }

    /// The first failing block, if the run failed
    pub fn failed_block(&self) -> Option<Uuid> {
        match self.outcome {
            RunOutcome::Failed { block_id, .. } => Some(block_id),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ActiveRun {
    token: CancellationToken,
    request_id: Option<Uuid>,
}

/// Cancels whatever the executor is currently running
///
/// Cancelling flips the run's token, which stops the current block and every later one,
/// and tells the backend to abandon the request in flight.
#[derive(Clone)]
pub struct RunController {
    api: ApiClient,
    active: Arc<Mutex<ActiveRun>>,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController").finish_non_exhaustive()
    }
}

impl RunController {
    fn new(api: ApiClient) -> Self {
        Self {
            api,
            active: Arc::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ActiveRun> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh token for a new invocation
    fn begin(&self) -> CancellationToken {
        let mut active = self.lock();
        *active = ActiveRun::default();
        active.token.clone()
    }

    fn set_request(&self, request_id: Option<Uuid>) {
        self.lock().request_id = request_id;
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().token.is_cancelled()
    }

    pub async fn cancel(&self) -> Result<(), ApiError> {
        let (token, request_id) = {
            let active = self.lock();
            (active.token.clone(), active.request_id)
        };
        token.cancel();

        match request_id {
            Some(request_id) => {
                tracing::info!("Cancelling run, request {request_id}");
                self.api.cancel_request(request_id).await
            }
            None => Ok(()),
        }
    }
}

/// Runs a workflow's blocks in order against one variable store
#[derive(TypedBuilder)]
pub struct WorkflowExecutor {
    #[builder(default = Arc::new(BlockRegistry::with_defaults()))]
    registry: Arc<BlockRegistry>,
    variables: Arc<VariableStore>,
    api: ApiClient,
    #[builder(default, setter(strip_option(fallback = jobs_opt)))]
    jobs: Option<JobSchedulerHandle>,
    #[builder(default = Arc::new(NoOpNotifier))]
    notifier: Arc<dyn RunNotifier>,
    #[builder(default, setter(strip_option(fallback = event_bus_opt)))]
    event_bus: Option<Arc<dyn EventBus>>,
    #[builder(default)]
    state: Arc<RunState>,
    #[builder(default)]
    config: Arc<RuntimeConfig>,
    #[builder(setter(skip), default = RunController::new(api.clone()))]
    controller: RunController,
}

impl WorkflowExecutor {
    pub fn controller(&self) -> RunController {
        self.controller.clone()
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.variables
    }

    /// Run from the first block with the configured checkpoint behaviour
    pub async fn run(&self, workflow: &Workflow) -> Result<RunReport, WorkflowError> {
        self.run_with(workflow, RunOptions::from_config(&self.config))
            .await
    }

    /// Continue a paused run right after its checkpoint
    pub async fn resume(
        &self,
        workflow: &Workflow,
        checkpoint_id: Uuid,
    ) -> Result<RunReport, WorkflowError> {
        let options =
            RunOptions::from_config(&self.config).starting_at(RunStart::AfterBlock(checkpoint_id));
        self.run_with(workflow, options).await
    }

    pub async fn run_with(
        &self,
        workflow: &Workflow,
        options: RunOptions,
    ) -> Result<RunReport, WorkflowError> {
        // Bindings are checked per block, as earlier blocks may create their variables
        workflow.check_block_numbers()?;
        let blocks = workflow.ordered_blocks();
        let start = match options.start {
            RunStart::Beginning => 0,
            RunStart::Index(index) => index.min(blocks.len()),
            RunStart::AfterBlock(id) => {
                blocks
                    .iter()
                    .position(|block| block.id == id)
                    .ok_or(WorkflowError::BlockNotFound(id))?
                    + 1
            }
        };

        let workflow_id = workflow.id;
        let token = self.controller.begin();
        let mut report = RunReport::new(workflow_id);

        tracing::info!(
            "Running workflow {name} from block {start} of {count}",
            name = workflow.name,
            count = blocks.len()
        );
        self.emit(WorkflowEvent::RunStarted { workflow_id }).await;

        let remaining = &blocks[start..];
        for (position, block) in remaining.iter().enumerate() {
            if token.is_cancelled() {
                report.outcome = RunOutcome::Cancelled {
                    block_id: Some(block.id),
                };
                break;
            }

            if block.skip {
                tracing::debug!("Skipping block {name}", name = block.name);
                report.skipped.push(block.id);
                self.emit(WorkflowEvent::BlockSkipped {
                    workflow_id,
                    block_id: block.id,
                })
                .await;
                continue;
            }

            report.attempted.push(block.id);
            match self.process(workflow, block, &token).await {
                ExecutionResult::Success => {
                    report.succeeded.push(block.id);
                    let has_more = position + 1 < remaining.len();
                    if block.is_checkpoint() && options.pause_at_checkpoints && has_more {
                        report.outcome = RunOutcome::Paused { block_id: block.id };
                        break;
                    }
                }
                ExecutionResult::Failure => {
                    report.outcome = RunOutcome::Failed {
                        block_id: block.id,
                        error: self.state.block(block.id).error.unwrap_or_default(),
                    };
                    break;
                }
                ExecutionResult::Cancelled => {
                    report.outcome = RunOutcome::Cancelled {
                        block_id: Some(block.id),
                    };
                    break;
                }
            }
        }

        self.controller.set_request(None);
        self.finish(workflow, &report).await;
        Ok(report)
    }

    /// Run one block without advancing to the next
    pub async fn run_single_block(
        &self,
        workflow: &Workflow,
        block_id: Uuid,
    ) -> Result<ExecutionResult, WorkflowError> {
        let block = workflow
            .block(block_id)
            .ok_or(WorkflowError::BlockNotFound(block_id))?;
        let token = self.controller.begin();
        let result = self.process(workflow, block, &token).await;
        self.controller.set_request(None);
        Ok(result)
    }

    async fn process(
        &self,
        workflow: &Workflow,
        block: &Block,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let request_id = Uuid::new_v4();
        self.controller.set_request(Some(request_id));

        let context = ExecutionContext::builder()
            .workflow_id(workflow.id)
            .workflow_name(workflow.name.clone())
            .block_id(block.id)
            .request_id(request_id)
            .variables(self.variables.clone())
            .api(self.api.clone())
            .jobs_opt(self.jobs.clone())
            .notifier(self.notifier.clone())
            .event_bus_opt(self.event_bus.clone())
            .cancellation_token(token.clone())
            .config(self.config.clone())
            .build();

        self.registry.process_block(block, &context, &self.state).await
    }

    async fn finish(&self, workflow: &Workflow, report: &RunReport) {
        let workflow_id = workflow.id;
        let event = match &report.outcome {
            RunOutcome::Completed => {
                tracing::info!("Workflow {name} completed", name = workflow.name);
                if let Err(e) = self
                    .notifier
                    .run_completed(workflow_id, &workflow.name)
                    .await
                {
                    tracing::warn!("Failed to send completion notification: {e}");
                }
                WorkflowEvent::RunCompleted { workflow_id }
            }
            RunOutcome::Failed { block_id, error } => WorkflowEvent::RunFailed {
                workflow_id,
                block_id: *block_id,
                error: error.clone(),
            },
            RunOutcome::Cancelled { .. } => {
                tracing::info!("Workflow {name} cancelled", name = workflow.name);
                WorkflowEvent::RunCancelled { workflow_id }
            }
            RunOutcome::Paused { block_id } => {
                tracing::info!("Workflow {name} paused at checkpoint", name = workflow.name);
                WorkflowEvent::RunPaused {
                    workflow_id,
                    block_id: *block_id,
                }
            }
        };
        self.emit(event).await;
    }

    async fn emit(&self, event: WorkflowEvent) {
        if let Some(event_bus) = &self.event_bus {
            if let Err(e) = event_bus.emit(event).await {
                tracing::warn!("Failed to emit workflow event: {e}");
            }
        }
    }
}
