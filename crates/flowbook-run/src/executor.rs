use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use flowbook_runtime::{
    blocks::{BlockKind, BlockRegistry},
    client::{ApiClient, ApiError, HttpNotifier, NoOpNotifier, RunNotifier},
    config::RuntimeConfig,
    execution::ExecutionResult,
    jobs::{
        JobError, JobEvent, JobKey, JobSchedulerConfig, JobSchedulerHandle, JobState,
        SelectionChange,
    },
    storage::{FsStorage, StorageError, WorkflowStorage},
    variables::{VariableError, VariableStore},
    workflow::{
        RunOptions, RunOutcome, RunReport, RunStart, Workflow, WorkflowError, WorkflowExecutor,
    },
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

use crate::workflows::WorkflowFile;

type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Variable error: {0}")]
    Variable(#[from] VariableError),

    #[error("Invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Job scheduler error: {0}")]
    Job(#[from] JobError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// What to run, as chosen on the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSelection {
    pub start_after: Option<Uuid>,
    pub block: Option<Uuid>,
    pub no_pause: bool,
    /// Exit without waiting for research jobs still running at the end of the run
    pub no_wait: bool,
    /// Save every result of finished research jobs into their block's output variable
    pub save_results: bool,
}

pub struct Executor {
    file: WorkflowFile,
    config: RuntimeConfig,
    selection: RunSelection,
    interactive: bool,
}

impl Executor {
    pub fn new(
        file: WorkflowFile,
        config: RuntimeConfig,
        selection: RunSelection,
        interactive: bool,
    ) -> Self {
        Self {
            file,
            config,
            selection,
            interactive,
        }
    }

    /// Run the workflow, returning whether it succeeded
    pub async fn execute(&self) -> Result<bool> {
        let workflow = &self.file.workflow;
        let api = ApiClient::new(&self.config.api_base_url)?;

        let storage: Arc<dyn WorkflowStorage> = Arc::new(FsStorage::new(self.config.data_dir()));
        storage.save_workflow(workflow).await?;
        self.seed_variables(storage.as_ref()).await?;

        let variables = Arc::new(VariableStore::load(workflow.id, storage.clone()).await?);
        workflow.validate(&variables)?;

        let jobs = JobSchedulerHandle::spawn(
            JobSchedulerConfig::builder()
                .storage(storage.clone())
                .protocols(JobSchedulerConfig::http_protocols(&api))
                .poll_interval(self.config.poll_interval())
                .build(),
        );
        let mut events = jobs.subscribe();
        let reattached = jobs.reattach(workflow.id).await?;
        if !reattached.is_empty() {
            println!(
                "Found {} research job(s) still running from an earlier run",
                reattached.len()
            );
        }

        let notifier: Arc<dyn RunNotifier> = match &self.config.notify_email {
            Some(email) => Arc::new(HttpNotifier::new(api.clone(), email.clone())),
            None => Arc::new(NoOpNotifier),
        };

        let executor = WorkflowExecutor::builder()
            .registry(Arc::new(BlockRegistry::with_defaults()))
            .variables(variables.clone())
            .api(api)
            .jobs(jobs.clone())
            .notifier(notifier)
            .config(Arc::new(self.config.clone()))
            .build();

        let controller = executor.controller();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling...");
                if let Err(e) = controller.cancel().await {
                    tracing::warn!("Failed to cancel remote request: {e}");
                }
            }
        });

        let result = match self.selection.block {
            Some(block_id) => self.run_single(&executor, workflow, block_id).await,
            None => self.run_all(&executor, workflow).await,
        };
        ctrl_c.abort();

        let result = match result {
            Ok(succeeded) => self
                .settle_jobs(&jobs, &mut events, &variables, &reattached)
                .await
                .map(|researched| succeeded && researched),
            Err(e) => Err(e),
        };
        jobs.shutdown();
        result
    }

    /// Wait for the research jobs of this workflow, then report the ones that finished.
    /// Returns false when one of them failed.
    async fn settle_jobs(
        &self,
        jobs: &JobSchedulerHandle,
        events: &mut broadcast::Receiver<JobEvent>,
        variables: &VariableStore,
        reattached: &[JobKey],
    ) -> Result<bool> {
        let workflow = &self.file.workflow;
        let pending = unfinished_jobs(jobs, workflow, reattached).await?;

        let wait = if self.selection.no_wait || pending.is_empty() {
            JobWait::drain(events, pending)
        } else {
            println!("Waiting for {} research job(s) to finish...", pending.len());
            wait_for_jobs(jobs, events, pending, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?
        };

        if !wait.unfinished.is_empty() {
            println!(
                "{} research job(s) still running; they are picked up on the next run",
                wait.unfinished.len()
            );
        }

        report_jobs(
            jobs,
            workflow,
            variables,
            &wait.finished,
            self.selection.save_results.then_some(self.config.value_delimiter.as_str()),
        )
        .await
    }

    /// Store variables declared by the file that do not exist yet
    async fn seed_variables(&self, storage: &dyn WorkflowStorage) -> Result<()> {
        let workflow_id = self.file.workflow.id;
        let existing = storage.load_variables(workflow_id).await?;
        for seed in &self.file.variables {
            if existing.iter().any(|v| v.id == seed.id || v.name == seed.name) {
                continue;
            }
            tracing::debug!("Creating variable {name}", name = seed.name);
            storage.save_variable(&seed.to_variable(workflow_id)).await?;
        }
        Ok(())
    }

    async fn run_single(
        &self,
        executor: &WorkflowExecutor,
        workflow: &Workflow,
        block_id: Uuid,
    ) -> Result<bool> {
        let result = executor.run_single_block(workflow, block_id).await?;
        let name = workflow
            .block(block_id)
            .map(|block| block.name.as_str())
            .unwrap_or_default();
        let state = executor.state().block(block_id);

        match result {
            ExecutionResult::Success => println!("✓ {name}"),
            ExecutionResult::Failure => println!("✗ {name}"),
            ExecutionResult::Cancelled => println!("- {name} (cancelled)"),
        }
        print_block_details(state.output.as_deref(), state.error.as_deref());
        Ok(result.is_success())
    }

    async fn run_all(&self, executor: &WorkflowExecutor, workflow: &Workflow) -> Result<bool> {
        let pause_at_checkpoints = self.config.pause_at_checkpoints && !self.selection.no_pause;
        let mut start = match self.selection.start_after {
            Some(block_id) => RunStart::AfterBlock(block_id),
            None => RunStart::Beginning,
        };

        loop {
            let options = RunOptions {
                start,
                pause_at_checkpoints,
            };
            let report = executor.run_with(workflow, options).await?;
            print_report(executor, workflow, &report);

            let RunOutcome::Paused { block_id } = report.outcome else {
                return Ok(report.is_success());
            };

            if !self.interactive {
                println!("Paused at checkpoint. Resume with:");
                println!("    flowbook-run <file> --start-after {block_id}");
                return Ok(true);
            }

            println!("Paused at checkpoint. Press Enter to resume...");
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
            start = RunStart::AfterBlock(block_id);
        }
    }
}

/// Research jobs of `workflow`, or reattached from an earlier run, that are still running
async fn unfinished_jobs(
    jobs: &JobSchedulerHandle,
    workflow: &Workflow,
    reattached: &[JobKey],
) -> Result<BTreeSet<JobKey>> {
    let research = workflow
        .ordered_blocks()
        .into_iter()
        .filter(|block| matches!(block.kind, BlockKind::Research(_)))
        .map(|block| JobKey::new(workflow.id, block.id));

    let mut pending = BTreeSet::new();
    for key in research.chain(reattached.iter().copied()) {
        let active = jobs
            .status(key)
            .await?
            .is_some_and(|status| status.status.is_active());
        if active {
            pending.insert(key);
        }
    }
    Ok(pending)
}

#[derive(Debug, Default, PartialEq)]
struct JobWait {
    /// Jobs that reached a terminal state while this process watched them
    finished: BTreeSet<JobKey>,
    unfinished: BTreeSet<JobKey>,
}

impl JobWait {
    fn observe(&mut self, event: &JobEvent) {
        if event.status.status.is_terminal() {
            self.unfinished.remove(&event.key);
            self.finished.insert(event.key);
        }
    }

    /// Take the events already received without waiting for more
    fn drain(events: &mut broadcast::Receiver<JobEvent>, unfinished: BTreeSet<JobKey>) -> Self {
        let mut wait = JobWait {
            unfinished,
            ..Default::default()
        };
        loop {
            match events.try_recv() {
                Ok(event) => wait.observe(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {skipped} research job event(s)");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        wait
    }
}

/// Receive job events until every job in `pending` is terminal or `interrupt` resolves
async fn wait_for_jobs(
    jobs: &JobSchedulerHandle,
    events: &mut broadcast::Receiver<JobEvent>,
    pending: BTreeSet<JobKey>,
    interrupt: impl Future<Output = ()>,
) -> Result<JobWait> {
    tokio::pin!(interrupt);
    let mut wait = JobWait {
        unfinished: pending,
        ..Default::default()
    };

    while !wait.unfinished.is_empty() {
        tokio::select! {
            _ = &mut interrupt => break,
            event = events.recv() => match event {
                Ok(event) => wait.observe(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Missed {skipped} job event(s), checking status directly");
                    for key in wait.unfinished.clone() {
                        let status = jobs.status(key).await?;
                        if status.is_some_and(|status| !status.status.is_active()) {
                            wait.unfinished.remove(&key);
                            wait.finished.insert(key);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let rest = JobWait::drain(events, std::mem::take(&mut wait.unfinished));
    wait.unfinished = rest.unfinished;
    wait.finished.extend(rest.finished);
    Ok(wait)
}

/// Print the outcome of each finished job. With a delimiter, every result of a
/// completed job is saved to the output variable of its block.
async fn report_jobs(
    jobs: &JobSchedulerHandle,
    workflow: &Workflow,
    variables: &VariableStore,
    finished: &BTreeSet<JobKey>,
    save_with: Option<&str>,
) -> Result<bool> {
    let mut succeeded = true;
    for &key in finished {
        let Some(block) = workflow.block(key.block_id) else {
            continue;
        };
        let Some(status) = jobs.status(key).await? else {
            continue;
        };

        match status.status {
            JobState::Complete => {
                let status = match jobs.finalize(key).await {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!("Failed to finalize research job {key}: {e}");
                        status
                    }
                };
                println!("✓ {} (research)", block.name);
                if let Some(result) = &status.result {
                    print_block_details(Some(&result.summary), None);
                    for item in &result.items {
                        match &item.title {
                            Some(title) => println!("    - {title} <{}>", item.url),
                            None => println!("    - {}", item.url),
                        }
                    }
                }

                if let (Some(delimiter), Some(binding)) = (save_with, &block.output_variable) {
                    jobs.select(key, SelectionChange::SelectAll).await?;
                    let saved = jobs
                        .save_selection(key, binding, variables, delimiter)
                        .await?;
                    println!("    saved {saved} result(s) to {}", binding.name);
                }
            }
            JobState::Error => {
                succeeded = false;
                println!("✗ {} (research)", block.name);
                print_block_details(None, status.error.as_deref());
            }
            JobState::Idle | JobState::Waiting | JobState::Processing => {}
        }
    }
    Ok(succeeded)
}

fn print_report(executor: &WorkflowExecutor, workflow: &Workflow, report: &RunReport) {
    for block in workflow.ordered_blocks() {
        let state = executor.state().block(block.id);
        if report.skipped.contains(&block.id) {
            println!("- {} (skipped)", block.name);
        } else if report.succeeded.contains(&block.id) {
            println!("✓ {}", block.name);
            print_block_details(state.output.as_deref(), None);
        } else if !report.attempted.contains(&block.id) {
            continue;
        } else if state.last_result == Some(ExecutionResult::Cancelled) {
            println!("- {} (cancelled)", block.name);
        } else {
            println!("✗ {}", block.name);
            print_block_details(None, state.error.as_deref());
        }
    }

    match &report.outcome {
        RunOutcome::Completed => println!("Workflow completed"),
        RunOutcome::Failed { error, .. } => println!("Workflow failed: {error}"),
        RunOutcome::Cancelled { .. } => println!("Workflow cancelled"),
        RunOutcome::Paused { .. } => {}
    }
}

fn print_block_details(output: Option<&str>, error: Option<&str>) {
    if let Some(output) = output.filter(|o| !o.trim().is_empty()) {
        for line in output.lines() {
            println!("    {line}");
        }
    }
    if let Some(error) = error {
        println!("    error: {error}");
    }
}
