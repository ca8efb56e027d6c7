use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::client::ApiError;
use crate::execution::{BlockOutput, ExecutionContext};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PromptImage>,
    /// Extra context sent along with the prompts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_data: Option<String>,
    /// Document the model answers from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub save_as_csv: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptImage {
    pub name: String,
    /// Base64 payload or URL
    pub data: String,
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    system_prompt: String,
    user_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    processed_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [PromptImage]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<&'a str>,
    save_as_csv: bool,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    success: bool,
    response: Option<String>,
    error: Option<String>,
    #[serde(default)]
    needs_api_key: bool,
}

/// Calls the model endpoint with interpolated prompts
pub struct PromptHandler;

#[async_trait]
impl BlockHandler for PromptHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::Prompt(config) = &block.kind else {
            return Err(block.mismatch(BlockType::Prompt));
        };
        if config.user_prompt.trim().is_empty() {
            return Err(BlockError::Validation("Please enter a prompt".to_string()));
        }

        let interpolator = context.interpolator(context.text_policy());
        let processed_data = match &config.processed_data {
            Some(data) => Some(interpolator.interpolate(data)?.text),
            None => None,
        };
        let request = ModelRequest {
            system_prompt: interpolator.interpolate(&config.system_prompt)?.text,
            user_prompt: interpolator.interpolate(&config.user_prompt)?.text,
            processed_data,
            images: (!config.images.is_empty()).then_some(config.images.as_slice()),
            download_url: config.source_url.as_deref(),
            save_as_csv: config.save_as_csv,
        };

        let endpoint = if request.download_url.is_some() {
            "/api/call-model-with-source"
        } else {
            "/api/call-model"
        };
        tracing::trace!("Calling model for block {id}", id = block.id);
        let response: ModelResponse = context.api().post_json(endpoint, &request).await?;

        if response.needs_api_key {
            return Err(ApiError::NeedsApiKey.into());
        }
        if !response.success {
            return Err(BlockError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "The model call failed".to_string()),
            ));
        }

        let text = response.response.unwrap_or_default();
        // Column bindings take one row per comma-separated value
        let writes_column = block
            .output_variable
            .as_ref()
            .is_some_and(|binding| binding.column_name.is_some());
        let output = if writes_column {
            BlockOutput::List(text.split(',').map(|v| v.trim().to_string()).collect())
        } else {
            BlockOutput::Text(text)
        };
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::OutputBinding;
    use crate::test_support::{context, memory_store, scalar, table};
    use crate::variables::VariableKind;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn prompt_block(system: &str, user: &str) -> Block {
        Block::builder()
            .block_number(1)
            .name("Research")
            .kind(BlockKind::Prompt(PromptConfig {
                system_prompt: system.to_string(),
                user_prompt: user.to_string(),
                ..Default::default()
            }))
            .build()
    }

    #[tokio::test]
    async fn test_prompts_are_interpolated() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/call-model").json_body(json!({
                "system_prompt": "You are a researcher",
                "user_prompt": "Research Acme",
                "save_as_csv": false
            }));
            then.status(200)
                .json_body(json!({"success": true, "response": "Acme makes anvils"}));
        });

        let store = memory_store();
        scalar(&store, "company", "Acme").await;
        let block = prompt_block("You are a researcher", "Research {{company}}");
        let ctx = context(&server.base_url(), &store, block.id);

        let output = PromptHandler.process(&block, &ctx).await.unwrap();

        mock.assert();
        assert_eq!(output, Some(BlockOutput::Text("Acme makes anvils".into())));
    }

    #[tokio::test]
    async fn test_missing_variable_uses_fallback_text() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/call-model").json_body(json!({
                "system_prompt": "",
                "user_prompt": "Research no value saved to `company`",
                "save_as_csv": false
            }));
            then.status(200).json_body(json!({"success": true, "response": "?"}));
        });

        let store = memory_store();
        let block = prompt_block("", "Research {{company}}");
        let ctx = context(&server.base_url(), &store, block.id);

        PromptHandler.process(&block, &ctx).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_needs_api_key_and_quota() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/call-model");
            then.status(200)
                .json_body(json!({"success": false, "needs_api_key": true}));
        });

        let store = memory_store();
        let block = prompt_block("", "hi");
        let ctx = context(&server.base_url(), &store, block.id);
        let err = PromptHandler.process(&block, &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "An API key is required");

        let limited = MockServer::start();
        limited.mock(|when, then| {
            when.method(POST).path("/api/call-model");
            then.status(403).body("quota");
        });
        let ctx = context(&limited.base_url(), &store, block.id);
        let err = PromptHandler.process(&block, &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Free tier limit reached");
    }

    #[tokio::test]
    async fn test_remote_error_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/call-model");
            then.status(200)
                .json_body(json!({"success": false, "error": "model overloaded"}));
        });

        let store = memory_store();
        let block = prompt_block("", "hi");
        let ctx = context(&server.base_url(), &store, block.id);
        let err = PromptHandler.process(&block, &ctx).await.unwrap_err();
        assert!(matches!(err, BlockError::Remote(ref m) if m == "model overloaded"));
    }

    #[tokio::test]
    async fn test_column_binding_splits_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/call-model");
            then.status(200)
                .json_body(json!({"success": true, "response": "Acme, Globex ,Initech"}));
        });

        let store = memory_store();
        let companies = table(&store, "companies", vec![]).await;
        store.add_table_column(companies.id, "name").await.unwrap();
        let mut block = prompt_block("", "List competitors");
        block.output_variable = Some(
            OutputBinding::builder()
                .id(companies.id)
                .name("companies")
                .kind(VariableKind::Table)
                .column_name("name")
                .build(),
        );
        let ctx = context(&server.base_url(), &store, block.id);

        let output = PromptHandler.process(&block, &ctx).await.unwrap();
        assert_eq!(
            output,
            Some(BlockOutput::List(vec![
                "Acme".into(),
                "Globex".into(),
                "Initech".into()
            ]))
        );
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let store = memory_store();
        let block = prompt_block("system", "  ");
        let ctx = context("http://127.0.0.1:1", &store, block.id);
        assert!(matches!(
            PromptHandler.process(&block, &ctx).await,
            Err(BlockError::Validation(_))
        ));
    }
}
