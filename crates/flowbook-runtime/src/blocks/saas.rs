use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};

/// External services reached through the backend's integration endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaasProvider {
    Apollo,
    Jira,
    Salesforce,
    Gong,
}

impl SaasProvider {
    fn block_type(self) -> BlockType {
        match self {
            SaasProvider::Apollo => BlockType::Apollo,
            SaasProvider::Jira => BlockType::Jira,
            SaasProvider::Salesforce => BlockType::Salesforce,
            SaasProvider::Gong => BlockType::Gong,
        }
    }
}

/// Shared by every SaaS block. Each provider reads the fields it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaasConfig {
    /// Person to look up (Apollo)
    pub name: String,
    pub company: String,
    /// Question asked about the enrichment result (Apollo)
    pub prompt: String,
    /// Provider specific operation, e.g. `users` for Gong
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApolloRequest {
    name: String,
    company: String,
    request_id: Uuid,
    #[serde(skip_serializing_if = "String::is_empty")]
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
}

/// Resolved text fields of a [`SaasConfig`]
struct SaasQuery {
    name: String,
    company: String,
    prompt: String,
}

pub struct SaasHandler {
    provider: SaasProvider,
}

impl SaasHandler {
    pub fn new(provider: SaasProvider) -> Self {
        Self { provider }
    }

    fn config<'a>(&self, block: &'a Block) -> Result<&'a SaasConfig, BlockError> {
        match (&block.kind, self.provider) {
            (BlockKind::Apollo(config), SaasProvider::Apollo)
            | (BlockKind::Jira(config), SaasProvider::Jira)
            | (BlockKind::Salesforce(config), SaasProvider::Salesforce)
            | (BlockKind::Gong(config), SaasProvider::Gong) => Ok(config),
            _ => Err(block.mismatch(self.provider.block_type())),
        }
    }

    async fn apollo(
        context: &ExecutionContext,
        config: &SaasConfig,
        query: SaasQuery,
    ) -> Result<String, BlockError> {
        if query.name.trim().is_empty() || query.company.trim().is_empty() {
            return Err(BlockError::Validation(
                "Please enter both name and company".to_string(),
            ));
        }

        let response: Value = context
            .api()
            .post_json(
                "/api/apollo_enrich",
                &ApolloRequest {
                    name: query.name,
                    company: query.company,
                    request_id: context.request_id(),
                    prompt: query.prompt,
                    api_key: config.api_key.clone().filter(|key| !key.is_empty()),
                },
            )
            .await?;

        if let Some(error) = response.get("error").and_then(Value::as_str) {
            return Err(BlockError::Remote(error.to_string()));
        }
        match response.get("analysis").and_then(Value::as_str) {
            Some(analysis) => Ok(analysis.to_string()),
            None => Ok(pretty(&response)),
        }
    }

    async fn jira(context: &ExecutionContext, query: SaasQuery) -> Result<String, BlockError> {
        let company = query.company.trim();
        let params: Vec<(&str, &str)> = if company.is_empty() {
            Vec::new()
        } else {
            vec![("company", company)]
        };
        let response: Value = context.api().get_json("/jira/search", &params).await?;

        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(BlockError::Remote(remote_error(&response, "Jira search failed")));
        }
        Ok(pretty(response.get("issues").unwrap_or(&response)))
    }

    async fn salesforce(
        context: &ExecutionContext,
        query: SaasQuery,
    ) -> Result<String, BlockError> {
        let company = query.company.trim();
        if company.is_empty() {
            return Err(BlockError::Validation(
                "Please enter a company".to_string(),
            ));
        }
        let response: Value = context
            .api()
            .get_json("/salesforce/query-all", &[("company", company)])
            .await?;

        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(BlockError::Remote(remote_error(
                &response,
                "Salesforce query failed",
            )));
        }
        Ok(pretty(&response))
    }

    async fn gong(context: &ExecutionContext, config: &SaasConfig) -> Result<String, BlockError> {
        let path = match config.operation.as_str() {
            "users" => "/gong/users",
            _ => "/gong/calls",
        };
        let response: Value = context.api().get_json(path, &[]).await?;

        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(BlockError::Remote(remote_error(&response, "Gong request failed")));
        }
        Ok(pretty(&response))
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn remote_error(response: &Value, fallback: &str) -> String {
    response
        .get("error")
        .or_else(|| response.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

#[async_trait]
impl BlockHandler for SaasHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let config = self.config(block)?;

        let interpolator = context.interpolator(context.text_policy());
        let query = SaasQuery {
            name: interpolator.interpolate(&config.name)?.text,
            company: interpolator.interpolate(&config.company)?.text,
            prompt: interpolator.interpolate(&config.prompt)?.text,
        };

        tracing::trace!(
            "Calling {provider:?} for block {id}",
            provider = self.provider,
            id = block.id
        );
        let output = match self.provider {
            SaasProvider::Apollo => Self::apollo(context, config, query).await?,
            SaasProvider::Jira => Self::jira(context, query).await?,
            SaasProvider::Salesforce => Self::salesforce(context, query).await?,
            SaasProvider::Gong => Self::gong(context, config).await?,
        };

        Ok(Some(BlockOutput::Text(output)))
    }
}
