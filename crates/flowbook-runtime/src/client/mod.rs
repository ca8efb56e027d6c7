//! Client for the remote Flowbook API
//!
//! Blocks and research protocols talk to the backend through [`ApiClient`], a thin
//! JSON-over-HTTP wrapper around `reqwest`. Endpoint-specific request and response
//! types live next to the code that uses them.

mod notifier;

pub use notifier::{HttpNotifier, NoOpNotifier, RunNotifier};

use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid API URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Free tier limit reached")]
    QuotaExceeded,

    #[error("An API key is required")]
    NeedsApiKey,

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Serialize)]
struct CancelRequest {
    request_id: Uuid,
}

/// HTTP client bound to the API base URL
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    http: Client,
}

impl ApiClient {
    /// Create a client. Endpoint paths are resolved relative to `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            http: Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        tracing::trace!("POST {url}");
        let response = self.http.post(url).json(body).send().await?;
        Self::decode(response).await
    }

    pub async fn get_json<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        tracing::trace!("GET {url}");
        let response = self.http.get(url).query(query).send().await?;
        Self::decode(response).await
    }

    /// POST and return the raw response once its status is known to be successful
    pub async fn post_streaming<B>(&self, path: &str, body: &B) -> Result<Response, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        tracing::trace!("POST (stream) {url}");
        let response = self.http.post(url).json(body).send().await?;
        Self::check_status(response).await
    }

    /// Ask the backend to abandon the work started under `request_id`
    pub async fn cancel_request(&self, request_id: Uuid) -> Result<(), ApiError> {
        tracing::debug!("Cancelling request {request_id}");
        let _: serde_json::Value = self
            .post_json("/api/cancel", &CancelRequest { request_id })
            .await?;
        Ok(())
    }

    async fn check_status(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(ApiError::QuotaExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let response = Self::check_status(response).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}
