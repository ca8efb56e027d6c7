use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::ApiError;
use crate::jobs::{JobKey, JobResult, JobState};

/// Status reported by one poll of a [`PollProtocol`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Waiting,
    Processing,
    Complete,
    Error(String),
}

/// Remote job observed by periodic status checks
#[async_trait]
pub trait PollProtocol: Send + Sync {
    /// Submit the job. Returns once the remote has accepted it.
    async fn start(&self, key: &JobKey, request_id: Uuid, query: &str) -> Result<(), ApiError>;

    async fn check_status(&self, key: &JobKey, request_id: Uuid) -> Result<PollStatus, ApiError>;

    /// Fetch the full result of a completed job
    async fn load_status(&self, key: &JobKey, request_id: Uuid) -> Result<JobResult, ApiError>;

    async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Called,
    Processing,
    Complete,
    Error,
}

impl From<StreamStatus> for JobState {
    fn from(status: StreamStatus) -> Self {
        match status {
            StreamStatus::Called => JobState::Waiting,
            StreamStatus::Processing => JobState::Processing,
            StreamStatus::Complete => JobState::Complete,
            StreamStatus::Error => JobState::Error,
        }
    }
}

/// One pushed update of a [`StreamProtocol`] subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub status: StreamStatus,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub result_urls: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Remote job that pushes its progress to a subscriber
#[async_trait]
pub trait StreamProtocol: Send + Sync {
    async fn start(&self, key: &JobKey, request_id: Uuid, query: &str) -> Result<(), ApiError>;

    /// Open a subscription. The receiver yields updates until the remote closes it.
    async fn subscribe(
        &self,
        key: &JobKey,
        request_id: Uuid,
    ) -> Result<mpsc::Receiver<StreamUpdate>, ApiError>;

    /// Materialize the final result once the stream has reported completion
    async fn finalize(&self, key: &JobKey, request_id: Uuid) -> Result<JobResult, ApiError>;

    async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub enum JobProtocol {
    Poll(Arc<dyn PollProtocol>),
    Stream(Arc<dyn StreamProtocol>),
}

impl JobProtocol {
    pub async fn start(&self, key: &JobKey, request_id: Uuid, query: &str) -> Result<(), ApiError> {
        match self {
            JobProtocol::Poll(protocol) => protocol.start(key, request_id, query).await,
            JobProtocol::Stream(protocol) => protocol.start(key, request_id, query).await,
        }
    }

    pub async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError> {
        match self {
            JobProtocol::Poll(protocol) => protocol.cancel(request_id).await,
            JobProtocol::Stream(protocol) => protocol.cancel(request_id).await,
        }
    }

    pub fn is_poll(&self) -> bool {
        matches!(self, JobProtocol::Poll(_))
    }
}

impl std::fmt::Debug for JobProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobProtocol::Poll(_) => write!(f, "JobProtocol::Poll"),
            JobProtocol::Stream(_) => write!(f, "JobProtocol::Stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPoll {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PollProtocol for RecordingPoll {
        async fn start(&self, _: &JobKey, _: Uuid, query: &str) -> Result<(), ApiError> {
            self.calls.lock().unwrap().push(format!("start {query}"));
            Ok(())
        }

        async fn check_status(&self, _: &JobKey, _: Uuid) -> Result<PollStatus, ApiError> {
            Ok(PollStatus::Waiting)
        }

        async fn load_status(&self, _: &JobKey, _: Uuid) -> Result<JobResult, ApiError> {
            Err(ApiError::Remote("not finished".into()))
        }

        async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError> {
            self.calls.lock().unwrap().push(format!("cancel {request_id}"));
            Ok(())
        }
    }

    #[test]
    fn test_stream_update_defaults() {
        let update: StreamUpdate = serde_json::from_str(r#"{"status": "called"}"#).unwrap();
        assert_eq!(
            update,
            StreamUpdate {
                status: StreamStatus::Called,
                value: None,
                result_urls: vec![],
                error: None,
            }
        );

        let done: StreamUpdate = serde_json::from_str(
            r#"{"status": "complete", "value": "summary", "result_urls": ["https://a.example"]}"#,
        )
        .unwrap();
        assert_eq!(done.result_urls, vec!["https://a.example".to_string()]);
    }

    #[test]
    fn test_stream_status_maps_to_job_state() {
        assert_eq!(JobState::from(StreamStatus::Called), JobState::Waiting);
        assert_eq!(JobState::from(StreamStatus::Processing), JobState::Processing);
        assert_eq!(JobState::from(StreamStatus::Complete), JobState::Complete);
        assert_eq!(JobState::from(StreamStatus::Error), JobState::Error);
    }

    #[tokio::test]
    async fn test_job_protocol_dispatches_to_poll() {
        let poll = Arc::new(RecordingPoll::default());
        let protocol = JobProtocol::Poll(poll.clone());
        let key = JobKey::new(Uuid::new_v4(), Uuid::new_v4());
        let request_id = Uuid::new_v4();

        protocol.start(&key, request_id, "Acme").await.unwrap();
        protocol.cancel(request_id).await.unwrap();

        assert!(protocol.is_poll());
        assert_eq!(
            *poll.calls.lock().unwrap(),
            vec!["start Acme".to_string(), format!("cancel {request_id}")]
        );
    }
}
