use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blocks::{Block, BlockError, BlockHandler, BlockKind, BlockType};
use crate::execution::{BlockOutput, ExecutionContext};
use crate::interpolation::{InterpolationPolicy, MissingValue};

const DEFAULT_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    #[default]
    Search,
    News,
    Finance,
    Markets,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub engine: SearchEngine,
    pub query: String,
    pub limit: u32,
    /// News topic to browse instead of a query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            engine: SearchEngine::default(),
            query: String::new(),
            limit: DEFAULT_LIMIT,
            topic_token: None,
            section_token: None,
            image_prompt: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    engine: SearchEngine,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    section_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_prompt: Option<&'a str>,
}

impl SearchConfig {
    fn topic(&self) -> Option<&str> {
        match self.engine {
            SearchEngine::News => self.topic_token.as_deref().filter(|t| !t.is_empty()),
            _ => None,
        }
    }
}

/// Result URLs of a search response, by engine
fn result_urls(engine: SearchEngine, response: &Value) -> Vec<String> {
    let (items, field) = match engine {
        SearchEngine::Search | SearchEngine::News => (response.get("results"), "link"),
        SearchEngine::Finance | SearchEngine::Markets => (
            response
                .get("results")
                .and_then(|r| r.get(0))
                .and_then(|r| r.get("results")),
            "link",
        ),
        SearchEngine::Image => (response.get("results"), "original"),
    };

    items
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Runs a web, news, finance, markets or image search and returns the result URLs
pub struct SearchHandler;

#[async_trait]
impl BlockHandler for SearchHandler {
    async fn process(
        &self,
        block: &Block,
        context: &ExecutionContext,
    ) -> Result<Option<BlockOutput>, BlockError> {
        let BlockKind::Search(config) = &block.kind else {
            return Err(block.mismatch(BlockType::Search));
        };

        let request = match config.topic() {
            Some(topic) => SearchRequest {
                engine: config.engine,
                query: None,
                num: None,
                topic_token: Some(topic),
                section_token: config.section_token.as_deref().filter(|s| !s.is_empty()),
                image_prompt: None,
            },
            None => {
                if config.query.trim().is_empty() {
                    return Err(BlockError::Validation(
                        "Please enter a search query".to_string(),
                    ));
                }
                let query = context
                    .interpolator(InterpolationPolicy::new(MissingValue::Keep))
                    .interpolate(&config.query)?
                    .text;
                SearchRequest {
                    engine: config.engine,
                    query: Some(query),
                    num: Some(if config.limit == 0 { DEFAULT_LIMIT } else { config.limit }),
                    topic_token: None,
                    section_token: None,
                    image_prompt: match config.engine {
                        SearchEngine::Image => config.image_prompt.as_deref(),
                        _ => None,
                    },
                }
            }
        };

        let endpoint = match config.engine {
            SearchEngine::Image => "/api/image_search",
            _ => "/api/search",
        };
        let response: Value = context.api().post_json(endpoint, &request).await?;
        let urls = result_urls(config.engine, &response);
        tracing::debug!(
            "Search for block {id} returned {count} results",
            id = block.id,
            count = urls.len()
        );

        Ok(Some(BlockOutput::List(urls)))
    }
}
