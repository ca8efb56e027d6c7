use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};
use crate::interpolation::{row_source, InterpolationPolicy, MissingValue};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebFetchConfig {
    /// Page to fetch. A `{{table.column}}` reference fetches one page per row.
    pub url: String,
    /// What to extract from the page
    pub prompt: String,
}

#[derive(Debug, Serialize)]
struct ScrapeRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    request_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
struct ScrapeResponse {
    markdown: Option<String>,
    analysis: Option<String>,
    #[serde(default)]
    cancelled: bool,
}

impl ScrapeResponse {
    fn content(self) -> Option<String> {
        self.analysis
            .or(self.markdown)
            .filter(|content| !content.trim().is_empty())
    }
}

/// Table and column updated in place, one row per fetched page
struct InPlace {
    table_id: Uuid,
    column: String,
}

/// Scrapes pages and extracts content from them
pub struct WebFetchHandler;

impl WebFetchHandler {
    async fn write_row(
        context: &ExecutionContext,
        target: &InPlace,
        row_id: &str,
        content: &str,
    ) -> Result<(), BlockError> {
        let mut partial = Map::new();
        partial.insert(target.column.clone(), Value::String(content.to_string()));
        context
            .variables()
            .update_table_row(target.table_id, row_id, partial)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BlockHandler for WebFetchHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::WebFetch(config) = &block.kind else {
            return Err(block.mismatch(BlockType::WebFetch));
        };
        if config.url.trim().is_empty() {
            return Err(BlockError::Validation("URL is required".to_string()));
        }

        let store = context.variables();
        let interpolator = context.interpolator(InterpolationPolicy::new(MissingValue::Keep));
        let pages = interpolator.interpolate_rows(&config.url)?;
        let prompt = interpolator.interpolate(&config.prompt)?.text;

        // With a column binding on the table the URLs come from, results go back into
        // the row each URL was read from
        let source_table = row_source(&config.url)?
            .and_then(|(table, _)| store.get_variable_by_name(&table))
            .map(|table| table.id);
        let in_place = block.output_variable.as_ref().and_then(|binding| {
            match (&binding.column_name, source_table) {
                (Some(column), Some(table_id)) if table_id == binding.id => Some(InPlace {
                    table_id,
                    column: column.clone(),
                }),
                _ => None,
            }
        });

        let mut results = Vec::new();
        for page in &pages {
            let url = page.text.trim();
            if url.is_empty() || !page.unresolved.is_empty() {
                continue;
            }
            if context.cancellation_token().is_cancelled() {
                return Err(BlockError::Cancelled);
            }

            tracing::trace!("Fetching {url} for block {id}", id = block.id);
            let request = ScrapeRequest {
                url,
                prompt: (!prompt.is_empty()).then_some(prompt.as_str()),
                request_id: context.request_id(),
            };
            let outcome = match context
                .api()
                .post_json::<_, ScrapeResponse>("/scrape", &request)
                .await
            {
                Ok(response) if response.cancelled => return Err(BlockError::Cancelled),
                Ok(response) => response
                    .content()
                    .ok_or_else(|| "No valid data returned".to_string()),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(content) => {
                    if let Some(target) = &in_place {
                        Self::write_row(context, target, &page.row_id, &content).await?;
                    }
                    results.push(format!("{url}: {content}"));
                }
                Err(error) => {
                    tracing::warn!("Failed to fetch {url}: {error}");
                    if let Some(target) = &in_place {
                        Self::write_row(context, target, &page.row_id, &format!("Error: {error}"))
                            .await?;
                    }
                }
            }
        }

        if results.is_empty() {
            return Err(BlockError::Remote(
                "No valid results from any URLs".to_string(),
            ));
        }

        let combined = results.join("\n\n");
        Ok(Some(match in_place {
            Some(_) => BlockOutput::Applied(combined),
            None => BlockOutput::Text(combined),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::OutputBinding;
    use crate::test_support::{context, memory_store, table};
    use crate::variables::VariableKind;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fetch_block(url: &str, prompt: &str) -> Block {
        Block::builder()
            .block_number(1)
            .name("Fetch")
            .kind(BlockKind::WebFetch(WebFetchConfig {
                url: url.to_string(),
                prompt: prompt.to_string(),
            }))
            .build()
    }

    #[tokio::test]
    async fn test_single_page() {
        let server = MockServer::start();
        let store = memory_store();
        let block = fetch_block("https://acme.example", "");
        let ctx = context(&server.base_url(), &store, block.id);

        let mock = server.mock(|when, then| {
            when.method(POST).path("/scrape").json_body(json!({
                "url": "https://acme.example",
                "request_id": ctx.request_id()
            }));
            then.status(200).json_body(json!({"markdown": "# Acme"}));
        });

        let output = WebFetchHandler.process(&block, &ctx).await.unwrap();

        mock.assert();
        assert_eq!(
            output,
            Some(BlockOutput::Text("https://acme.example: # Acme".into()))
        );
    }

    #[tokio::test]
    async fn test_rows_updated_in_place() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/scrape")
                .json_body_includes(r#"{"url": "https://a.example"}"#);
            then.status(200).json_body(json!({"analysis": "sells anvils"}));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/scrape")
                .json_body_includes(r#"{"url": "https://b.example"}"#);
            then.status(500).body("unreachable");
        });

        let store = memory_store();
        let leads = table(
            &store,
            "leads",
            vec![
                json!({"id": "r1", "site": "https://a.example"}),
                json!({"id": "r2", "site": "https://b.example"}),
            ],
        )
        .await;
        store.add_table_column(leads.id, "summary").await.unwrap();

        let mut block = fetch_block("{{leads.site}}", "What do they sell?");
        block.output_variable = Some(
            OutputBinding::builder()
                .id(leads.id)
                .name("leads")
                .kind(VariableKind::Table)
                .column_name("summary")
                .build(),
        );
        let ctx = context(&server.base_url(), &store, block.id);

        let output = WebFetchHandler.process(&block, &ctx).await.unwrap();

        assert_eq!(
            output,
            Some(BlockOutput::Applied("https://a.example: sells anvils".into()))
        );
        let rows = store.get_variable(leads.id).unwrap().as_table().unwrap().rows.clone();
        assert_eq!(rows[0].get("summary").as_deref(), Some("sells anvils"));
        assert!(rows[1].get("summary").unwrap().starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_cancelled_reply_stops_block() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/scrape");
            then.status(200).json_body(json!({"cancelled": true}));
        });

        let store = memory_store();
        let block = fetch_block("https://acme.example", "");
        let ctx = context(&server.base_url(), &store, block.id);

        assert!(matches!(
            WebFetchHandler.process(&block, &ctx).await,
            Err(BlockError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_no_results_is_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/scrape");
            then.status(200).json_body(json!({"markdown": ""}));
        });

        let store = memory_store();
        let block = fetch_block("https://acme.example", "");
        let ctx = context(&server.base_url(), &store, block.id);

        assert!(matches!(
            WebFetchHandler.process(&block, &ctx).await,
            Err(BlockError::Remote(_))
        ));
    }
}
