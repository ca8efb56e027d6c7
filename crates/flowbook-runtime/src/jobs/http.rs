//! HTTP implementations of the research protocols

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::{ApiClient, ApiError};
use crate::jobs::{
    JobKey, JobResult, PollProtocol, PollStatus, ResearchItem, StreamProtocol, StreamUpdate,
};

#[derive(Serialize)]
struct StartResearchRequest<'a> {
    user_id: String,
    block_id: Uuid,
    query: &'a str,
    request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_mode: Option<&'a str>,
}

#[derive(Serialize)]
struct JobLookupRequest {
    user_id: String,
    block_id: Uuid,
    request_id: Uuid,
}

impl JobLookupRequest {
    fn new(key: &JobKey, request_id: Uuid) -> Self {
        Self {
            user_id: key.workflow_id.to_string(),
            block_id: key.block_id,
            request_id,
        }
    }
}

#[derive(Deserialize)]
struct StartResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl StartResponse {
    fn into_result(self) -> Result<(), ApiError> {
        if self.success {
            Ok(())
        } else {
            Err(ApiError::Remote(
                self.error
                    .unwrap_or_else(|| "Failed to start research".to_string()),
            ))
        }
    }
}

#[derive(Deserialize)]
struct CheckStatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// A citation is either a bare URL or an object with a title
#[derive(Deserialize)]
#[serde(untagged)]
enum Citation {
    Url(String),
    Item {
        url: String,
        #[serde(default)]
        title: Option<String>,
    },
}

impl From<Citation> for ResearchItem {
    fn from(citation: Citation) -> Self {
        match citation {
            Citation::Url(url) => ResearchItem::new(url),
            Citation::Item { url, title } => ResearchItem { url, title },
        }
    }
}

#[derive(Deserialize)]
struct LoadStatusResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    citations: Vec<Citation>,
}

/// Polled research service
#[derive(Debug, Clone)]
pub struct HttpPollProtocol {
    api: ApiClient,
}

impl HttpPollProtocol {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PollProtocol for HttpPollProtocol {
    async fn start(&self, key: &JobKey, request_id: Uuid, query: &str) -> Result<(), ApiError> {
        let response: StartResponse = self
            .api
            .post_json(
                "/api/perplexity/start_research",
                &StartResearchRequest {
                    user_id: key.workflow_id.to_string(),
                    block_id: key.block_id,
                    query,
                    request_id,
                    reasoning_effort: Some("medium"),
                    search_mode: Some("web"),
                },
            )
            .await?;
        response.into_result()
    }

    async fn check_status(&self, key: &JobKey, request_id: Uuid) -> Result<PollStatus, ApiError> {
        let response: CheckStatusResponse = self
            .api
            .post_json(
                "/api/perplexity/check_perplexity_status",
                &JobLookupRequest::new(key, request_id),
            )
            .await?;

        Ok(match response.status.as_str() {
            "complete" | "completed" => PollStatus::Complete,
            "error" | "failed" => PollStatus::Error(
                response
                    .error
                    .unwrap_or_else(|| "Research failed".to_string()),
            ),
            "processing" | "running" => PollStatus::Processing,
            _ => PollStatus::Waiting,
        })
    }

    async fn load_status(&self, key: &JobKey, request_id: Uuid) -> Result<JobResult, ApiError> {
        let response: LoadStatusResponse = self
            .api
            .post_json(
                "/api/perplexity/load_status",
                &JobLookupRequest::new(key, request_id),
            )
            .await?;

        Ok(JobResult {
            summary: response.summary.or(response.value).unwrap_or_default(),
            items: response.citations.into_iter().map(Into::into).collect(),
        })
    }

    async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError> {
        self.api.cancel_request(request_id).await
    }
}

#[derive(Deserialize)]
struct FinalizeResponse {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    result_urls: Vec<String>,
}

/// Streaming research service
///
/// The subscription endpoint answers with newline-delimited JSON, one
/// [`StreamUpdate`] per line.
#[derive(Debug, Clone)]
pub struct HttpStreamProtocol {
    api: ApiClient,
}

impl HttpStreamProtocol {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StreamProtocol for HttpStreamProtocol {
    async fn start(&self, key: &JobKey, request_id: Uuid, query: &str) -> Result<(), ApiError> {
        let response: StartResponse = self
            .api
            .post_json(
                "/api/start_deep_research",
                &StartResearchRequest {
                    user_id: key.workflow_id.to_string(),
                    block_id: key.block_id,
                    query,
                    request_id,
                    reasoning_effort: None,
                    search_mode: None,
                },
            )
            .await?;
        response.into_result()
    }

    async fn subscribe(
        &self,
        key: &JobKey,
        request_id: Uuid,
    ) -> Result<mpsc::Receiver<StreamUpdate>, ApiError> {
        let mut response = self
            .api
            .post_streaming(
                "/api/deep_research/subscribe",
                &JobLookupRequest::new(key, request_id),
            )
            .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Research stream for request {request_id} failed: {e}");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !forward_line(&line, &tx).await {
                        return;
                    }
                }
            }
            forward_line(&buffer, &tx).await;
        });

        Ok(rx)
    }

    async fn finalize(&self, key: &JobKey, request_id: Uuid) -> Result<JobResult, ApiError> {
        let response: FinalizeResponse = self
            .api
            .post_json(
                "/api/finalize_deep_result",
                &JobLookupRequest::new(key, request_id),
            )
            .await?;

        Ok(JobResult {
            summary: response.value.unwrap_or_default(),
            items: response
                .result_urls
                .into_iter()
                .map(ResearchItem::new)
                .collect(),
        })
    }

    async fn cancel(&self, request_id: Uuid) -> Result<(), ApiError> {
        self.api.cancel_request(request_id).await
    }
}

/// Parse one NDJSON line and send it on. Returns false once the receiver is gone.
async fn forward_line(line: &[u8], tx: &mpsc::Sender<StreamUpdate>) -> bool {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return true;
    }
    match serde_json::from_str::<StreamUpdate>(text) {
        Ok(update) => tx.send(update).await.is_ok(),
        Err(e) => {
            tracing::warn!("Ignoring malformed research stream line: {e}");
            true
        }
    }
}
