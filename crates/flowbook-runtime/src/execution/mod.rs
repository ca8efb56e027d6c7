//! Block execution context
//!
//! Every block handler receives an [`ExecutionContext`] carrying the resources of the
//! run it belongs to: the workflow's variable store, the API client, the job scheduler,
//! and the cancellation token shared with the run's [`crate::workflow::RunController`].
//!
//! Key types:
//! - [`ExecutionContext`]: explicit per-invocation resources, no global state
//! - [`CancellationToken`]: cooperative cancellation shared across a run
//! - [`BlockOutput`]: what a handler produced, before it is written to a binding

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use ts_rs::TS;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::client::{ApiClient, NoOpNotifier, RunNotifier};
use crate::config::RuntimeConfig;
use crate::events::{EventBus, WorkflowEvent};
use crate::interpolation::{InterpolationPolicy, Interpolator};
use crate::jobs::{JobKey, JobSchedulerHandle};
use crate::variables::VariableStore;

/// Outcome of processing one block
#[derive(TS, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ExecutionResult {
    Success,
    Failure,
    /// Stopped by the operator. Neither success nor failure.
    Cancelled,
}

impl ExecutionResult {
    pub fn is_success(self) -> bool {
        matches!(self, ExecutionResult::Success)
    }
}

/// Value produced by a block handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutput {
    Text(String),
    /// Several values, e.g. result URLs. Saved as a delimited scalar or one row each.
    List(Vec<String>),
    /// The handler already wrote its results into the variable store
    Applied(String),
}

impl BlockOutput {
    /// Text shown to the operator
    pub fn display(&self, delimiter: &str) -> String {
        match self {
            BlockOutput::Text(text) | BlockOutput::Applied(text) => text.clone(),
            BlockOutput::List(items) => items.join(delimiter),
        }
    }
}

/// Token for cancelling a run
///
/// Cloned into every block of the run. Cancelling is permanent for that token.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail while we hold it
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Resources available to a block while it runs
///
/// Contexts are built per block invocation by the workflow executor. Each carries a
/// fresh request id that network-bound blocks send along, so the run can be cancelled
/// remotely.
#[derive(TypedBuilder, Clone)]
pub struct ExecutionContext {
    pub(crate) workflow_id: Uuid,
    #[builder(default, setter(into))]
    pub(crate) workflow_name: String,
    pub(crate) block_id: Uuid,
    #[builder(default = Uuid::new_v4())]
    pub(crate) request_id: Uuid,
    variables: Arc<VariableStore>,
    api: ApiClient,
    #[builder(default, setter(strip_option(fallback = jobs_opt)))]
    jobs: Option<JobSchedulerHandle>,
    #[builder(default = Arc::new(NoOpNotifier))]
    notifier: Arc<dyn RunNotifier>,
    #[builder(default, setter(strip_option(fallback = event_bus_opt)))]
    event_bus: Option<Arc<dyn EventBus>>,
    #[builder(default)]
    cancellation_token: CancellationToken,
    #[builder(default)]
    config: Arc<RuntimeConfig>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workflow_id", &self.workflow_id)
            .field("block_id", &self.block_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl ExecutionContext {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn block_id(&self) -> Uuid {
        self.block_id
    }

    /// Id sent with every remote call made for this invocation
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.workflow_id, self.block_id)
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.variables
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn jobs(&self) -> Option<&JobSchedulerHandle> {
        self.jobs.as_ref()
    }

    pub fn notifier(&self) -> &Arc<dyn RunNotifier> {
        &self.notifier
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn interpolator(&self, policy: InterpolationPolicy) -> Interpolator<'_> {
        Interpolator::new(&self.variables, policy)
    }

    /// Interpolation policy for prose fields, honouring the configured missing-value mode
    pub fn text_policy(&self) -> InterpolationPolicy {
        InterpolationPolicy::new(self.config.missing_value)
    }

    pub(crate) async fn emit(&self, event: WorkflowEvent) {
        if let Some(event_bus) = &self.event_bus {
            if let Err(e) = event_bus.emit(event).await {
                tracing::warn!("Failed to emit workflow event: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellation_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        // Already cancelled tokens resolve immediately
        token.cancelled().await;
    }

    #[test]
    fn test_output_display() {
        let list = BlockOutput::List(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(list.display(", "), "a, b");
        assert_eq!(BlockOutput::Text("x".to_string()).display(", "), "x");
    }
}
