use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::client::{ApiClient, ApiError};

/// Out-of-band notifications sent while a workflow runs
#[async_trait]
pub trait RunNotifier: Send + Sync {
    /// A checkpoint block was reached and the run is waiting for a human
    async fn checkpoint_reached(
        &self,
        workflow_id: Uuid,
        workflow_name: &str,
        block_name: &str,
        message: Option<&str>,
    ) -> Result<(), ApiError>;

    /// Every block of a run completed
    async fn run_completed(&self, workflow_id: Uuid, workflow_name: &str) -> Result<(), ApiError>;
}

pub struct NoOpNotifier;

#[async_trait]
impl RunNotifier for NoOpNotifier {
    async fn checkpoint_reached(
        &self,
        _workflow_id: Uuid,
        _workflow_name: &str,
        _block_name: &str,
        _message: Option<&str>,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    async fn run_completed(
        &self,
        _workflow_id: Uuid,
        _workflow_name: &str,
    ) -> Result<(), ApiError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct CheckInEmail<'a> {
    email: &'a str,
    workflow_id: Uuid,
    workflow_name: &'a str,
    block_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct CompletionEmail<'a> {
    email: &'a str,
    workflow_id: Uuid,
    workflow_name: &'a str,
}

/// Sends notifications as emails through the backend
pub struct HttpNotifier {
    api: ApiClient,
    email: String,
}

impl HttpNotifier {
    pub fn new(api: ApiClient, email: impl Into<String>) -> Self {
        Self {
            api,
            email: email.into(),
        }
    }
}

#[async_trait]
impl RunNotifier for HttpNotifier {
    async fn checkpoint_reached(
        &self,
        workflow_id: Uuid,
        workflow_name: &str,
        block_name: &str,
        message: Option<&str>,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .api
            .post_json(
                "/api/send-checkin-email",
                &CheckInEmail {
                    email: &self.email,
                    workflow_id,
                    workflow_name,
                    block_name,
                    message,
                },
            )
            .await?;
        Ok(())
    }

    async fn run_completed(&self, workflow_id: Uuid, workflow_name: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .api
            .post_json(
                "/api/send-completion-email",
                &CompletionEmail {
                    email: &self.email,
                    workflow_id,
                    workflow_name,
                },
            )
            .await?;
        Ok(())
    }
}
