//! Job scheduler actor
//!
//! A single task owns every active job. Callers talk to it through
//! [`JobSchedulerHandle`]; remote work (starting, polling, streaming, finalizing) runs in
//! spawned tasks that report back to the actor tagged with the request id they were
//! started under. The actor applies a report only if that request id is still the job's
//! current one, so output from a cancelled or restarted job can never land.
//!
//! Jobs that reach a terminal state are dropped from memory once their status is
//! persisted. Commands on such a job read it back from storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::blocks::OutputBinding;
use crate::client::{ApiClient, ApiError};
use crate::events::{EventBus, WorkflowEvent};
use crate::jobs::selection::{self, SelectionChange};
use crate::jobs::{
    AsyncJobStatus, HttpPollProtocol, HttpStreamProtocol, JobError, JobKey, JobProtocol,
    JobResult, JobState, PollStatus, ResearchEngine, ResearchItem, StreamStatus, StreamUpdate,
};
use crate::storage::WorkflowStorage;
use crate::variables::VariableStore;

pub type Reply<T> = oneshot::Sender<Result<T, JobError>>;

/// Broadcast whenever a job's status record changes
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub key: JobKey,
    pub status: AsyncJobStatus,
}

pub(crate) enum SchedulerCommand {
    Start {
        key: JobKey,
        engine: ResearchEngine,
        query: String,
        reply: Reply<AsyncJobStatus>,
    },
    Cancel {
        key: JobKey,
        reply: Reply<AsyncJobStatus>,
    },
    Status {
        key: JobKey,
        reply: Reply<Option<AsyncJobStatus>>,
    },
    /// Load persisted jobs of a workflow and resume observing the unfinished ones
    Reattach {
        workflow_id: Uuid,
        reply: Reply<Vec<JobKey>>,
    },
    Select {
        key: JobKey,
        change: SelectionChange,
        reply: Reply<AsyncJobStatus>,
    },
    Finalize {
        key: JobKey,
        reply: Reply<AsyncJobStatus>,
    },
    Shutdown,
}

/// Reports from spawned remote work, tagged with the originating request id
enum JobUpdate {
    Started {
        key: JobKey,
        request_id: Uuid,
        result: Result<(), ApiError>,
    },
    Polled {
        key: JobKey,
        request_id: Uuid,
        result: Result<PollStatus, ApiError>,
    },
    Loaded {
        key: JobKey,
        request_id: Uuid,
        result: Result<JobResult, ApiError>,
    },
    Streamed {
        key: JobKey,
        request_id: Uuid,
        update: StreamUpdate,
    },
    StreamClosed {
        key: JobKey,
        request_id: Uuid,
    },
    Failed {
        key: JobKey,
        request_id: Uuid,
        error: ApiError,
    },
    Finalized {
        key: JobKey,
        request_id: Uuid,
        result: Result<JobResult, ApiError>,
        reply: Reply<AsyncJobStatus>,
    },
}

#[derive(TypedBuilder)]
pub struct JobSchedulerConfig {
    storage: Arc<dyn WorkflowStorage>,

    #[builder(default)]
    protocols: HashMap<ResearchEngine, JobProtocol>,

    #[builder(default = Duration::from_secs(15))]
    poll_interval: Duration,

    #[builder(default, setter(strip_option(fallback = event_bus_opt)))]
    event_bus: Option<Arc<dyn EventBus>>,
}

impl JobSchedulerConfig {
    /// The HTTP protocols for every research engine
    pub fn http_protocols(api: &ApiClient) -> HashMap<ResearchEngine, JobProtocol> {
        HashMap::from([
            (
                ResearchEngine::Perplexity,
                JobProtocol::Poll(Arc::new(HttpPollProtocol::new(api.clone()))),
            ),
            (
                ResearchEngine::Deep,
                JobProtocol::Stream(Arc::new(HttpStreamProtocol::new(api.clone()))),
            ),
        ])
    }
}

struct ActiveJob {
    status: AsyncJobStatus,
    /// The remote has accepted the current request
    accepted: bool,
    /// A status check or result load is outstanding
    in_flight: bool,
    subscription: Option<JoinHandle<()>>,
}

impl ActiveJob {
    fn new(status: AsyncJobStatus) -> Self {
        Self {
            status,
            accepted: false,
            in_flight: false,
            subscription: None,
        }
    }

    fn stop_subscription(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
        }
    }
}

struct JobScheduler {
    storage: Arc<dyn WorkflowStorage>,
    protocols: HashMap<ResearchEngine, JobProtocol>,
    poll_interval: Duration,
    event_bus: Option<Arc<dyn EventBus>>,
    jobs: HashMap<JobKey, ActiveJob>,
    update_tx: mpsc::UnboundedSender<JobUpdate>,
    events: broadcast::Sender<JobEvent>,
}

impl JobScheduler {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut updates: mpsc::UnboundedReceiver<JobUpdate>,
    ) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SchedulerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(update) = updates.recv() => self.apply_update(update).await,
                _ = ticker.tick() => self.poll_due_jobs(),
            }
        }

        tracing::debug!("Job scheduler shutting down");
        for job in self.jobs.values_mut() {
            job.stop_subscription();
        }
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Start {
                key,
                engine,
                query,
                reply,
            } => {
                let _ = reply.send(self.start(key, engine, query).await);
            }
            SchedulerCommand::Cancel { key, reply } => {
                let _ = reply.send(self.cancel(key).await);
            }
            SchedulerCommand::Status { key, reply } => {
                let _ = reply.send(self.lookup(key).await);
            }
            SchedulerCommand::Reattach { workflow_id, reply } => {
                let _ = reply.send(self.reattach(workflow_id).await);
            }
            SchedulerCommand::Select { key, change, reply } => {
                let _ = reply.send(self.select(key, change).await);
            }
            SchedulerCommand::Finalize { key, reply } => self.finalize(key, reply).await,
            SchedulerCommand::Shutdown => {}
        }
    }

    async fn start(
        &mut self,
        key: JobKey,
        engine: ResearchEngine,
        query: String,
    ) -> Result<AsyncJobStatus, JobError> {
        let protocol = self
            .protocols
            .get(&engine)
            .cloned()
            .ok_or(JobError::NoProtocol(engine))?;

        if self.job_mut(key).await?.is_none() {
            self.jobs
                .insert(key, ActiveJob::new(AsyncJobStatus::new(engine)));
        }
        let Some(job) = self.jobs.get_mut(&key) else {
            return Err(JobError::NotFound(key.block_id));
        };
        if job.status.status.is_active() {
            return Err(JobError::AlreadyRunning(key.block_id));
        }

        let request_id = Uuid::new_v4();
        job.stop_subscription();
        job.status.engine = engine;
        job.status.begin(request_id, query.clone())?;
        job.accepted = false;
        job.in_flight = false;
        let snapshot = job.status.clone();

        tracing::debug!("Starting {engine:?} job {key} under request {request_id}");
        let subscription = self.spawn_driver(key, request_id, protocol, Some(query));
        if let Some(job) = self.jobs.get_mut(&key) {
            job.subscription = subscription;
        }

        self.commit(key, &snapshot).await;
        Ok(snapshot)
    }

    async fn cancel(&mut self, key: JobKey) -> Result<AsyncJobStatus, JobError> {
        let current = self
            .lookup(key)
            .await?
            .ok_or(JobError::NotFound(key.block_id))?;
        if current.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: current.status,
                to: JobState::Idle,
            });
        }
        let job = self
            .job_mut(key)
            .await?
            .ok_or(JobError::NotFound(key.block_id))?;

        let previous = job.status.request_id;
        job.stop_subscription();
        job.status.reset();
        job.accepted = false;
        job.in_flight = false;
        let snapshot = job.status.clone();

        if let (Some(request_id), Some(protocol)) =
            (previous, self.protocols.get(&snapshot.engine).cloned())
        {
            tracing::debug!("Cancelling job {key} (request {request_id})");
            tokio::spawn(async move {
                if let Err(e) = protocol.cancel(request_id).await {
                    tracing::warn!("Failed to cancel remote request {request_id}: {e}");
                }
            });
        }

        self.commit(key, &snapshot).await;
        Ok(snapshot)
    }

    async fn reattach(&mut self, workflow_id: Uuid) -> Result<Vec<JobKey>, JobError> {
        let statuses = self.storage.load_job_statuses(workflow_id).await?;
        let mut resumed = Vec::new();

        for (key, status) in statuses {
            if self.jobs.contains_key(&key) {
                continue;
            }

            // Settled jobs stay in storage until a command asks for them
            if !status.status.is_active() {
                continue;
            }
            let engine = status.engine;
            let request_id = status.request_id;
            let mut job = ActiveJob::new(status);
            job.accepted = true;
            self.jobs.insert(key, job);

            let Some(request_id) = request_id else {
                continue;
            };
            let Some(protocol) = self.protocols.get(&engine).cloned() else {
                tracing::warn!("Cannot reattach job {key}: no protocol for {engine:?}");
                continue;
            };

            tracing::info!("Reattaching to job {key} (request {request_id})");
            let subscription = self.spawn_driver(key, request_id, protocol, None);
            if let Some(job) = self.jobs.get_mut(&key) {
                job.subscription = subscription;
            }
            resumed.push(key);
        }

        Ok(resumed)
    }

    async fn select(
        &mut self,
        key: JobKey,
        change: SelectionChange,
    ) -> Result<AsyncJobStatus, JobError> {
        let job = self
            .job_mut(key)
            .await?
            .ok_or(JobError::NotFound(key.block_id))?;
        job.status.apply_selection(change)?;
        let snapshot = job.status.clone();
        self.commit(key, &snapshot).await;
        Ok(snapshot)
    }

    async fn finalize(&mut self, key: JobKey, reply: Reply<AsyncJobStatus>) {
        let status = match self.job_mut(key).await {
            Ok(Some(job)) => job.status.clone(),
            Ok(None) => {
                let _ = reply.send(Err(JobError::NotFound(key.block_id)));
                return;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let (Some(request_id), JobState::Complete) = (status.request_id, status.status) else {
            let _ = reply.send(Err(JobError::NotFinished));
            return;
        };

        match self.protocols.get(&status.engine).cloned() {
            Some(JobProtocol::Stream(protocol)) => {
                let tx = self.update_tx.clone();
                tokio::spawn(async move {
                    let result = protocol.finalize(&key, request_id).await;
                    let _ = tx.send(JobUpdate::Finalized {
                        key,
                        request_id,
                        result,
                        reply,
                    });
                });
            }
            // Polled jobs are materialized when they complete
            Some(JobProtocol::Poll(_)) => {
                let _ = reply.send(Ok(status));
                self.evict_settled(key);
            }
            None => {
                let _ = reply.send(Err(JobError::NoProtocol(status.engine)));
            }
        }
    }

    /// Spawn the remote work for a request. `query` is set when the job must be started;
    /// reattached jobs are only observed.
    fn spawn_driver(
        &self,
        key: JobKey,
        request_id: Uuid,
        protocol: JobProtocol,
        query: Option<String>,
    ) -> Option<JoinHandle<()>> {
        let tx = self.update_tx.clone();
        match protocol {
            JobProtocol::Poll(protocol) => {
                if let Some(query) = query {
                    tokio::spawn(async move {
                        let result = protocol.start(&key, request_id, &query).await;
                        let _ = tx.send(JobUpdate::Started {
                            key,
                            request_id,
                            result,
                        });
                    });
                }
                None
            }
            JobProtocol::Stream(protocol) => Some(tokio::spawn(async move {
                if let Some(query) = query {
                    let result = protocol.start(&key, request_id, &query).await;
                    let failed = result.is_err();
                    let _ = tx.send(JobUpdate::Started {
                        key,
                        request_id,
                        result,
                    });
                    if failed {
                        return;
                    }
                }

                match protocol.subscribe(&key, request_id).await {
                    Ok(mut stream) => {
                        while let Some(update) = stream.recv().await {
                            let update = JobUpdate::Streamed {
                                key,
                                request_id,
                                update,
                            };
                            if tx.send(update).is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(JobUpdate::StreamClosed { key, request_id });
                    }
                    Err(error) => {
                        let _ = tx.send(JobUpdate::Failed {
                            key,
                            request_id,
                            error,
                        });
                    }
                }
            })),
        }
    }

    fn poll_due_jobs(&mut self) {
        let protocols = &self.protocols;
        let due: Vec<_> = self
            .jobs
            .iter_mut()
            .filter_map(|(key, job)| {
                if !job.status.status.is_active() || !job.accepted || job.in_flight {
                    return None;
                }
                let request_id = job.status.request_id?;
                let Some(JobProtocol::Poll(protocol)) = protocols.get(&job.status.engine) else {
                    return None;
                };
                job.in_flight = true;
                Some((*key, request_id, protocol.clone()))
            })
            .collect();

        for (key, request_id, protocol) in due {
            let tx = self.update_tx.clone();
            tokio::spawn(async move {
                let result = protocol.check_status(&key, request_id).await;
                let _ = tx.send(JobUpdate::Polled {
                    key,
                    request_id,
                    result,
                });
            });
        }
    }

    /// Status of a job, in memory or persisted
    async fn lookup(&self, key: JobKey) -> Result<Option<AsyncJobStatus>, JobError> {
        match self.jobs.get(&key) {
            Some(job) => Ok(Some(job.status.clone())),
            None => Ok(self.storage.load_job_status(&key).await?),
        }
    }

    /// The job for `key`, read back from storage if it is not in memory
    async fn job_mut(&mut self, key: JobKey) -> Result<Option<&mut ActiveJob>, JobError> {
        if !self.jobs.contains_key(&key) {
            if let Some(status) = self.storage.load_job_status(&key).await? {
                let mut job = ActiveJob::new(status);
                job.accepted = true;
                self.jobs.insert(key, job);
            }
        }
        Ok(self.jobs.get_mut(&key))
    }

    /// Drop a terminal job from memory
    fn evict_settled(&mut self, key: JobKey) {
        let settled = self
            .jobs
            .get(&key)
            .is_some_and(|job| job.status.status.is_terminal() && !job.in_flight);
        if settled {
            if let Some(mut job) = self.jobs.remove(&key) {
                job.stop_subscription();
            }
            tracing::debug!("Job {key} settled");
        }
    }

    /// The job for `key` if `request_id` is its current request
    fn current_job(&mut self, key: &JobKey, request_id: Uuid) -> Option<&mut ActiveJob> {
        match self.jobs.get_mut(key) {
            Some(job) if job.status.is_current_request(request_id) => Some(job),
            _ => {
                tracing::warn!("Discarding stale update for job {key} (request {request_id})");
                None
            }
        }
    }

    async fn apply_update(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::Started {
                key,
                request_id,
                result,
            } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    return;
                };
                match result {
                    Ok(()) => job.accepted = true,
                    Err(e) => {
                        tracing::error!("Failed to start job {key}: {e}");
                        let _ = job.status.fail(e.to_string());
                        let snapshot = job.status.clone();
                        self.commit(key, &snapshot).await;
                    }
                }
            }

            JobUpdate::Polled {
                key,
                request_id,
                result,
            } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    return;
                };
                job.in_flight = false;
                let before = job.status.status;
                match result {
                    Ok(PollStatus::Waiting) => {}
                    Ok(PollStatus::Processing) => {
                        let _ = job.status.advance(JobState::Processing);
                    }
                    Ok(PollStatus::Complete) => {
                        job.in_flight = true;
                        let engine = job.status.engine;
                        if let Some(JobProtocol::Poll(protocol)) =
                            self.protocols.get(&engine).cloned()
                        {
                            let tx = self.update_tx.clone();
                            tokio::spawn(async move {
                                let result = protocol.load_status(&key, request_id).await;
                                let _ = tx.send(JobUpdate::Loaded {
                                    key,
                                    request_id,
                                    result,
                                });
                            });
                        }
                        return;
                    }
                    Ok(PollStatus::Error(message)) => {
                        let _ = job.status.fail(message);
                    }
                    Err(e) => {
                        tracing::error!("Status check for job {key} failed: {e}");
                        let _ = job.status.fail(e.to_string());
                    }
                }
                if job.status.status != before {
                    let snapshot = job.status.clone();
                    self.commit(key, &snapshot).await;
                }
            }

            JobUpdate::Loaded {
                key,
                request_id,
                result,
            } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    return;
                };
                job.in_flight = false;
                let applied = match result {
                    Ok(result) => job.status.complete(result),
                    Err(e) => {
                        tracing::error!("Failed to load result of job {key}: {e}");
                        job.status.fail(e.to_string())
                    }
                };
                if let Err(e) = applied {
                    tracing::warn!("Ignoring result for job {key}: {e}");
                    return;
                }
                let snapshot = job.status.clone();
                self.commit(key, &snapshot).await;
            }

            JobUpdate::Streamed {
                key,
                request_id,
                update,
            } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    return;
                };
                if job.status.status.is_terminal() {
                    return;
                }
                if update.value.is_some() {
                    job.status.progress = update.value.clone();
                }
                let applied = match update.status {
                    StreamStatus::Called => Ok(()),
                    StreamStatus::Processing => job.status.advance(JobState::Processing),
                    StreamStatus::Complete => job.status.complete(JobResult {
                        summary: update.value.unwrap_or_default(),
                        items: update
                            .result_urls
                            .into_iter()
                            .map(ResearchItem::new)
                            .collect(),
                    }),
                    StreamStatus::Error => job.status.fail(
                        update
                            .error
                            .unwrap_or_else(|| "Research failed".to_string()),
                    ),
                };
                if let Err(e) = applied {
                    tracing::warn!("Ignoring stream update for job {key}: {e}");
                    return;
                }
                let snapshot = job.status.clone();
                self.commit(key, &snapshot).await;
            }

            JobUpdate::StreamClosed { key, request_id } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    return;
                };
                job.subscription = None;
                if job.status.status.is_active() {
                    tracing::debug!("Stream for job {key} closed before completion");
                }
            }

            JobUpdate::Failed {
                key,
                request_id,
                error,
            } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    return;
                };
                tracing::error!("Job {key} failed: {error}");
                if job.status.fail(error.to_string()).is_ok() {
                    let snapshot = job.status.clone();
                    self.commit(key, &snapshot).await;
                }
            }

            JobUpdate::Finalized {
                key,
                request_id,
                result,
                reply,
            } => {
                let Some(job) = self.current_job(&key, request_id) else {
                    let _ = reply.send(Err(JobError::Stale(request_id)));
                    return;
                };
                match result {
                    Ok(result) => {
                        job.status.result = Some(result);
                        job.status.selected.clear();
                        let snapshot = job.status.clone();
                        self.commit(key, &snapshot).await;
                        let _ = reply.send(Ok(snapshot));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
        }
    }

    /// Persist and publish a status change. A terminal job leaves memory once persisted.
    async fn commit(&mut self, key: JobKey, status: &AsyncJobStatus) {
        let persisted = match self.storage.save_job_status(&key, status).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to persist status of job {key}: {e}");
                false
            }
        };

        let _ = self.events.send(JobEvent {
            key,
            status: status.clone(),
        });

        if let Some(event_bus) = &self.event_bus {
            let event = WorkflowEvent::JobStatusChanged {
                workflow_id: key.workflow_id,
                block_id: key.block_id,
                status: status.status,
            };
            if let Err(e) = event_bus.emit(event).await {
                tracing::warn!("Failed to emit status change of job {key}: {e}");
            }
        }

        if persisted {
            self.evict_settled(key);
        }
    }
}

/// Handle for interacting with the job scheduler
#[derive(Clone)]
pub struct JobSchedulerHandle {
    command_tx: mpsc::UnboundedSender<SchedulerCommand>,
    events: broadcast::Sender<JobEvent>,
}

impl std::fmt::Debug for JobSchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSchedulerHandle").finish_non_exhaustive()
    }
}

impl JobSchedulerHandle {
    /// Spawn the scheduler actor
    pub fn spawn(config: JobSchedulerConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (scheduler, update_rx) = JobScheduler::new(config);
        let events = scheduler.events.clone();

        tokio::spawn(scheduler.run(command_rx, update_rx));

        Self { command_tx, events }
    }

    /// Receive every status change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Start the job for a block, or restart it if it has finished
    pub async fn start(
        &self,
        key: JobKey,
        engine: ResearchEngine,
        query: impl Into<String>,
    ) -> Result<AsyncJobStatus, JobError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(SchedulerCommand::Start {
            key,
            engine,
            query: query.into(),
            reply,
        })?;
        rx.await.map_err(|_| JobError::SchedulerGone)?
    }

    /// Cancel an unfinished job. The remote is told to abandon the current request.
    pub async fn cancel(&self, key: JobKey) -> Result<AsyncJobStatus, JobError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Cancel { key, reply })?;
        rx.await.map_err(|_| JobError::SchedulerGone)?
    }

    pub async fn status(&self, key: JobKey) -> Result<Option<AsyncJobStatus>, JobError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Status { key, reply })?;
        rx.await.map_err(|_| JobError::SchedulerGone)?
    }

    /// Load a workflow's persisted jobs. Unfinished jobs are observed again, never
    /// restarted. Returns the keys of the reattached unfinished jobs.
    pub async fn reattach(&self, workflow_id: Uuid) -> Result<Vec<JobKey>, JobError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Reattach { workflow_id, reply })?;
        rx.await.map_err(|_| JobError::SchedulerGone)?
    }

    pub async fn select(
        &self,
        key: JobKey,
        change: SelectionChange,
    ) -> Result<AsyncJobStatus, JobError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Select { key, change, reply })?;
        rx.await.map_err(|_| JobError::SchedulerGone)?
    }

    /// Materialize the final result of a completed streaming job
    pub async fn finalize(&self, key: JobKey) -> Result<AsyncJobStatus, JobError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Finalize { key, reply })?;
        rx.await.map_err(|_| JobError::SchedulerGone)?
    }

    /// Write the selected results into `binding`. Returns the number of items saved.
    pub async fn save_selection(
        &self,
        key: JobKey,
        binding: &OutputBinding,
        store: &VariableStore,
        delimiter: &str,
    ) -> Result<usize, JobError> {
        let status = self
            .status(key)
            .await?
            .ok_or(JobError::NotFound(key.block_id))?;
        selection::save_selection(&status, binding, store, delimiter).await
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(SchedulerCommand::Shutdown);
    }
}

impl JobScheduler {
    fn new(config: JobSchedulerConfig) -> (Self, mpsc::UnboundedReceiver<JobUpdate>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let scheduler = Self {
            storage: config.storage,
            protocols: config.protocols,
            poll_interval: config.poll_interval,
            event_bus: config.event_bus,
            jobs: HashMap::new(),
            update_tx,
            events,
        };
        (scheduler, update_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{PollProtocol, StreamProtocol};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePoll {
        statuses: Mutex<VecDeque<PollStatus>>,
        started: Mutex<Vec<Uuid>>,
        checked: Mutex<Vec<Uuid>>,
        cancelled: Mutex<Vec<Uuid>>,
        loads: AtomicUsize,
    }

    impl FakePoll {
        fn with_statuses(statuses: Vec<PollStatus>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into()),
                ..Default::default()
            })
        }

        fn checks(&self) -> usize {
            self.checked.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PollProtocol for FakePoll {
        async fn start(
            &self,
            _key: &JobKey,
            request_id: Uuid,
            _query: &str,
        ) -> Result<(), ApiError> {
            self.started.lock().unwrap().push(request_id);
            Ok(())
        }

        async fn check_status(
            &self,
            _key: &JobKey,
            request_id: Uuid,
        ) -> Result<PollStatus, ApiError> {
            self.checked.lock().unwrap().push(request_id);
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PollStatus::Processing))
        }

        async fn load_status(
            &self,
            _key: &JobKey,
            _request_id: Uuid,
        ) -> Result<JobResult, ApiError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(JobResult {
                summary: "Acme has two competitors".to_string(),
                items: vec![
                    ResearchItem::new("https://a.example"),
                    ResearchItem::new("https://b.example"),
                ],
            })
        }

        async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError> {
            self.cancelled.lock().unwrap().push(request_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStream {
        updates: Mutex<Vec<StreamUpdate>>,
        started: Mutex<Vec<Uuid>>,
        subscribed: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl StreamProtocol for FakeStream {
        async fn start(
            &self,
            _key: &JobKey,
            request_id: Uuid,
            _query: &str,
        ) -> Result<(), ApiError> {
            self.started.lock().unwrap().push(request_id);
            Ok(())
        }

        async fn subscribe(
            &self,
            _key: &JobKey,
            request_id: Uuid,
        ) -> Result<mpsc::Receiver<StreamUpdate>, ApiError> {
            self.subscribed.lock().unwrap().push(request_id);
            let (tx, rx) = mpsc::channel(16);
            for update in self.updates.lock().unwrap().drain(..) {
                tx.try_send(update).unwrap();
            }
            Ok(rx)
        }

        async fn finalize(&self, _key: &JobKey, _request_id: Uuid) -> Result<JobResult, ApiError> {
            Ok(JobResult {
                summary: "final report".to_string(),
                items: vec![ResearchItem::new("https://final.example")],
            })
        }

        async fn cancel(&self, _request_id: Uuid) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn key() -> JobKey {
        JobKey::new(Uuid::new_v4(), Uuid::new_v4())
    }

    fn spawn_with(
        storage: Arc<MemoryStorage>,
        protocols: HashMap<ResearchEngine, JobProtocol>,
    ) -> JobSchedulerHandle {
        JobSchedulerHandle::spawn(
            JobSchedulerConfig::builder()
                .storage(storage)
                .protocols(protocols)
                .poll_interval(Duration::from_millis(10))
                .build(),
        )
    }

    fn poll_protocols(fake: Arc<FakePoll>) -> HashMap<ResearchEngine, JobProtocol> {
        HashMap::from([(ResearchEngine::Perplexity, JobProtocol::Poll(fake))])
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<JobEvent>,
        state: JobState,
    ) -> AsyncJobStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.status.status == state => return event.status,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("scheduler stopped"),
                }
            }
        })
        .await
        .expect("timed out waiting for job state")
    }

    #[tokio::test]
    async fn test_poll_job_runs_to_completion_once() {
        let storage = Arc::new(MemoryStorage::new());
        let fake = FakePoll::with_statuses(vec![
            PollStatus::Waiting,
            PollStatus::Processing,
            PollStatus::Complete,
        ]);
        let scheduler = spawn_with(storage.clone(), poll_protocols(fake.clone()));
        let mut events = scheduler.subscribe();
        let key = key();

        let started = scheduler
            .start(key, ResearchEngine::Perplexity, "acme competitors")
            .await
            .unwrap();
        assert_eq!(started.status, JobState::Waiting);

        wait_for(&mut events, JobState::Processing).await;
        let done = wait_for(&mut events, JobState::Complete).await;
        assert_eq!(done.result.unwrap().items.len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fake.checks(), 3);
        assert_eq!(fake.loads.load(Ordering::SeqCst), 1);

        let persisted = storage.load_job_status(&key).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobState::Complete);
        assert_eq!(persisted.request_id, started.request_id);
    }

    #[tokio::test]
    async fn test_poll_error_is_terminal() {
        let storage = Arc::new(MemoryStorage::new());
        let fake = FakePoll::with_statuses(vec![PollStatus::Error("quota".to_string())]);
        let scheduler = spawn_with(storage, poll_protocols(fake.clone()));
        let mut events = scheduler.subscribe();
        let key = key();

        scheduler
            .start(key, ResearchEngine::Perplexity, "q")
            .await
            .unwrap();
        let failed = wait_for(&mut events, JobState::Error).await;
        assert_eq!(failed.error.as_deref(), Some("quota"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.checks(), 1);
    }

    #[tokio::test]
    async fn test_cancel_resets_to_idle_and_notifies_remote() {
        let storage = Arc::new(MemoryStorage::new());
        let fake = FakePoll::with_statuses(vec![]);
        let scheduler = spawn_with(storage, poll_protocols(fake.clone()));
        let mut events = scheduler.subscribe();
        let key = key();

        let started = scheduler
            .start(key, ResearchEngine::Perplexity, "q")
            .await
            .unwrap();
        wait_for(&mut events, JobState::Processing).await;

        let cancelled = scheduler.cancel(key).await.unwrap();
        assert_eq!(cancelled.status, JobState::Idle);
        assert!(cancelled.request_id.is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let status = scheduler.status(key).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Idle);
        assert_eq!(
            fake.cancelled.lock().unwrap().clone(),
            vec![started.request_id.unwrap()]
        );
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let fake = FakePoll::with_statuses(vec![]);
        let scheduler = spawn_with(Arc::new(MemoryStorage::new()), poll_protocols(fake));
        let key = key();

        scheduler
            .start(key, ResearchEngine::Perplexity, "q")
            .await
            .unwrap();
        assert!(matches!(
            scheduler.start(key, ResearchEngine::Perplexity, "q").await,
            Err(JobError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_after_completion_uses_new_request() {
        let fake = FakePoll::with_statuses(vec![PollStatus::Complete]);
        let scheduler = spawn_with(Arc::new(MemoryStorage::new()), poll_protocols(fake.clone()));
        let mut events = scheduler.subscribe();
        let key = key();

        let first = scheduler
            .start(key, ResearchEngine::Perplexity, "q")
            .await
            .unwrap();
        wait_for(&mut events, JobState::Complete).await;

        let second = scheduler
            .start(key, ResearchEngine::Perplexity, "q")
            .await
            .unwrap();
        assert_eq!(second.status, JobState::Waiting);
        assert_ne!(first.request_id, second.request_id);
        assert!(second.result.is_none());
    }

    #[tokio::test]
    async fn test_missing_protocol() {
        let scheduler = spawn_with(Arc::new(MemoryStorage::new()), HashMap::new());
        assert!(matches!(
            scheduler.start(key(), ResearchEngine::Deep, "q").await,
            Err(JobError::NoProtocol(ResearchEngine::Deep))
        ));
    }

    #[tokio::test]
    async fn test_reattach_observes_without_restarting() {
        let storage = Arc::new(MemoryStorage::new());
        let key = key();
        let request_id = Uuid::new_v4();
        let mut persisted = AsyncJobStatus::new(ResearchEngine::Perplexity);
        persisted.begin(request_id, "q").unwrap();
        persisted.advance(JobState::Processing).unwrap();
        storage.save_job_status(&key, &persisted).await.unwrap();

        let fake = FakePoll::with_statuses(vec![PollStatus::Complete]);
        let scheduler = spawn_with(storage, poll_protocols(fake.clone()));
        let mut events = scheduler.subscribe();

        let resumed = scheduler.reattach(key.workflow_id).await.unwrap();
        assert_eq!(resumed, vec![key]);

        let done = wait_for(&mut events, JobState::Complete).await;
        assert_eq!(done.request_id, Some(request_id));
        assert!(fake.started.lock().unwrap().is_empty());
        assert_eq!(fake.checked.lock().unwrap()[0], request_id);
    }

    #[tokio::test]
    async fn test_stream_job_and_finalize() {
        let fake = Arc::new(FakeStream::default());
        fake.updates.lock().unwrap().extend([
            StreamUpdate {
                status: StreamStatus::Processing,
                value: Some("partial".to_string()),
                result_urls: vec![],
                error: None,
            },
            StreamUpdate {
                status: StreamStatus::Complete,
                value: Some("report".to_string()),
                result_urls: vec!["https://a.example".to_string()],
                error: None,
            },
        ]);
        let protocols = HashMap::from([(ResearchEngine::Deep, JobProtocol::Stream(fake.clone()))]);
        let scheduler = spawn_with(Arc::new(MemoryStorage::new()), protocols);
        let mut events = scheduler.subscribe();
        let key = key();

        scheduler.start(key, ResearchEngine::Deep, "q").await.unwrap();
        let processing = wait_for(&mut events, JobState::Processing).await;
        assert_eq!(processing.progress.as_deref(), Some("partial"));

        let complete = wait_for(&mut events, JobState::Complete).await;
        assert_eq!(complete.result.as_ref().unwrap().summary, "report");

        let finalized = scheduler.finalize(key).await.unwrap();
        assert_eq!(
            finalized.result.unwrap().items,
            vec![ResearchItem::new("https://final.example")]
        );
        assert_eq!(fake.started.lock().unwrap().len(), 1);
        assert_eq!(fake.subscribed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_requires_completion() {
        let fake = Arc::new(FakeStream::default());
        let protocols = HashMap::from([(ResearchEngine::Deep, JobProtocol::Stream(fake))]);
        let scheduler = spawn_with(Arc::new(MemoryStorage::new()), protocols);
        let key = key();

        scheduler.start(key, ResearchEngine::Deep, "q").await.unwrap();
        assert!(matches!(
            scheduler.finalize(key).await,
            Err(JobError::NotFinished)
        ));
    }

    #[tokio::test]
    async fn test_updates_for_stale_request_are_discarded() {
        let fake = FakePoll::with_statuses(vec![]);
        let config = JobSchedulerConfig::builder()
            .storage(Arc::new(MemoryStorage::new()))
            .protocols(poll_protocols(fake))
            .build();
        let (mut scheduler, _updates) = JobScheduler::new(config);
        let key = key();

        let first = scheduler
            .start(key, ResearchEngine::Perplexity, "q".to_string())
            .await
            .unwrap();
        let stale = first.request_id.unwrap();
        scheduler.cancel(key).await.unwrap();

        scheduler
            .apply_update(JobUpdate::Loaded {
                key,
                request_id: stale,
                result: Ok(JobResult::default()),
            })
            .await;
        assert_eq!(scheduler.jobs[&key].status.status, JobState::Idle);

        let second = scheduler
            .start(key, ResearchEngine::Perplexity, "q".to_string())
            .await
            .unwrap();
        scheduler
            .apply_update(JobUpdate::Streamed {
                key,
                request_id: stale,
                update: StreamUpdate {
                    status: StreamStatus::Complete,
                    value: Some("late".to_string()),
                    result_urls: vec![],
                    error: None,
                },
            })
            .await;

        let status = &scheduler.jobs[&key].status;
        assert_eq!(status.status, JobState::Waiting);
        assert_eq!(status.request_id, second.request_id);
        assert!(status.result.is_none());
    }

    struct FailingBus;

    #[async_trait]
    impl EventBus for FailingBus {
        async fn emit(
            &self,
            _event: WorkflowEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("bus closed".into())
        }
    }

    #[tokio::test]
    async fn test_event_bus_failure_does_not_block_persistence() {
        let storage = Arc::new(MemoryStorage::new());
        let config = JobSchedulerConfig::builder()
            .storage(storage.clone())
            .protocols(poll_protocols(FakePoll::with_statuses(vec![])))
            .event_bus(Arc::new(FailingBus))
            .build();
        let (mut scheduler, _updates) = JobScheduler::new(config);
        let key = key();

        scheduler
            .start(key, ResearchEngine::Perplexity, "q".to_string())
            .await
            .unwrap();

        let persisted = storage.load_job_status(&key).await.unwrap().unwrap();
        assert_eq!(persisted.status, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_settled_jobs_leave_memory() {
        let storage = Arc::new(MemoryStorage::new());
        let config = JobSchedulerConfig::builder()
            .storage(storage.clone())
            .protocols(poll_protocols(FakePoll::with_statuses(vec![])))
            .build();
        let (mut scheduler, _updates) = JobScheduler::new(config);
        let key = key();

        let started = scheduler
            .start(key, ResearchEngine::Perplexity, "q".to_string())
            .await
            .unwrap();
        scheduler
            .apply_update(JobUpdate::Loaded {
                key,
                request_id: started.request_id.unwrap(),
                result: Ok(JobResult {
                    summary: "done".to_string(),
                    items: vec![ResearchItem::new("https://a.example")],
                }),
            })
            .await;
        assert!(!scheduler.jobs.contains_key(&key));

        let status = scheduler.lookup(key).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Complete);

        let selected = scheduler
            .select(key, SelectionChange::SelectAll)
            .await
            .unwrap();
        assert_eq!(selected.selected.len(), 1);
        assert!(!scheduler.jobs.contains_key(&key));
        assert_eq!(
            storage.load_job_status(&key).await.unwrap().unwrap().selected,
            selected.selected
        );

        assert!(matches!(
            scheduler.cancel(key).await,
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_and_save_selection() {
        let storage = Arc::new(MemoryStorage::new());
        let fake = FakePoll::with_statuses(vec![PollStatus::Complete]);
        let scheduler = spawn_with(storage.clone(), poll_protocols(fake));
        let mut events = scheduler.subscribe();
        let key = key();

        scheduler
            .start(key, ResearchEngine::Perplexity, "q")
            .await
            .unwrap();
        wait_for(&mut events, JobState::Complete).await;

        let store = VariableStore::new(key.workflow_id, storage);
        let var = store
            .create_variable("sources", crate::variables::VariableKind::Scalar)
            .await
            .unwrap();
        let binding = OutputBinding::builder()
            .id(var.id)
            .name("sources")
            .kind(crate::variables::VariableKind::Scalar)
            .build();

        scheduler.select(key, SelectionChange::SelectAll).await.unwrap();
        let saved = scheduler
            .save_selection(key, &binding, &store, ", ")
            .await
            .unwrap();

        assert_eq!(saved, 2);
        assert_eq!(
            store.get_variable(var.id).unwrap().as_scalar(),
            Some("https://a.example, https://b.example")
        );
    }
}
