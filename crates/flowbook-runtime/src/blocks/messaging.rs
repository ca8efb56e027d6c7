use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageChannel {
    #[default]
    Email,
    Sms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub channel: MessageChannel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    channel: MessageChannel,
    recipient: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    subject: String,
    body: String,
    request_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    success: bool,
    error: Option<String>,
}

/// Sends an email or text message with interpolated content
pub struct MessagingHandler;

#[async_trait]
impl BlockHandler for MessagingHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::Messaging(config) = &block.kind else {
            return Err(block.mismatch(BlockType::Messaging));
        };

        let interpolator = context.interpolator(context.text_policy());
        let recipient = interpolator.interpolate(&config.recipient)?;
        if recipient.text.trim().is_empty() || !recipient.is_fully_resolved() {
            return Err(BlockError::Validation("Please enter a recipient".to_string()));
        }
        let body = interpolator.interpolate(&config.body)?.text;
        if body.trim().is_empty() {
            return Err(BlockError::Validation("Please enter a message".to_string()));
        }

        let request = SendMessageRequest {
            channel: config.channel,
            recipient: recipient.text.trim().to_string(),
            subject: interpolator.interpolate(&config.subject)?.text,
            body,
            request_id: context.request_id(),
        };
        let response: SendMessageResponse = context
            .api()
            .post_json("/api/send-message", &request)
            .await?;

        if !response.success {
            return Err(BlockError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "Failed to send message".to_string()),
            ));
        }

        tracing::debug!("Sent {:?} message to {}", request.channel, request.recipient);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, memory_store, scalar};
    use httpmock::prelude::*;
    use serde_json::json;

    fn message_block(recipient: &str, body: &str) -> Block {
        Block::builder()
            .block_number(4)
            .name("Notify sales")
            .kind(BlockKind::Messaging(MessagingConfig {
                channel: MessageChannel::Email,
                recipient: recipient.to_string(),
                subject: "New lead".to_string(),
                body: body.to_string(),
            }))
            .build()
    }

    #[tokio::test]
    async fn test_sends_interpolated_message() {
        let server = MockServer::start();
        let store = memory_store();
        scalar(&store, "owner", "sam@example.com").await;
        scalar(&store, "company", "Acme").await;
        let block = message_block("{{owner}}", "Follow up with {{company}}");
        let ctx = context(&server.base_url(), &store, block.id);

        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/send-message").json_body(json!({
                "channel": "email",
                "recipient": "sam@example.com",
                "subject": "New lead",
                "body": "Follow up with Acme",
                "request_id": ctx.request_id()
            }));
            then.status(200).json_body(json!({"success": true}));
        });

        MessagingHandler.process(&block, &ctx).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_unresolved_recipient_is_rejected() {
        let store = memory_store();
        let block = message_block("{{owner}}", "hello");
        let ctx = context("http://127.0.0.1:1", &store, block.id);

        assert!(matches!(
            MessagingHandler.process(&block, &ctx).await,
            Err(BlockError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/send-message");
            then.status(200)
                .json_body(json!({"success": false, "error": "invalid number"}));
        });

        let store = memory_store();
        let block = message_block("+15550100", "hello");
        let ctx = context(&server.base_url(), &store, block.id);

        let err = MessagingHandler.process(&block, &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid number");
    }
}
