//! Web tools: search and page scraping.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::tool::{Tool, require_str};

/// Maximum scraped body size fed back to the model.
const MAX_SCRAPE_CHARS: usize = 8_000;

/// Query a search endpoint and return the raw result payload.
pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns a list of results with titles, URLs and snippets."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"}
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let query = require_str(&args, "query", self.name())?;

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: format!("search endpoint returned HTTP {}", response.status()),
            });
        }

        response.text().await.map_err(|e| ToolError::ExecutionFailed {
            name: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Fetch a URL and return its (truncated) body text.
pub struct ScrapeTool {
    client: reqwest::Client,
}

impl ScrapeTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for ScrapeTool {
    fn name(&self) -> &str {
        "scrape"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its text content (truncated for long pages)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let url = require_str(&args, "url", self.name())?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: format!("'{url}' returned HTTP {}", response.status()),
            });
        }

        let body = response.text().await.map_err(|e| ToolError::ExecutionFailed {
            name: self.name().to_string(),
            reason: e.to_string(),
        })?;

        Ok(truncate_chars(&body, MAX_SCRAPE_CHARS))
    }
}

/// Truncate at a char boundary, marking the cut.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}\n[truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 100), "short");

        let long = "é".repeat(50);
        let cut = truncate_chars(&long, 10);
        assert!(cut.starts_with(&"é".repeat(10)));
        assert!(cut.ends_with("[truncated]"));
    }

    #[tokio::test]
    async fn search_requires_query() {
        let tool = WebSearchTool::new(reqwest::Client::new(), "http://localhost:0");
        let result = tool.invoke(json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidParameters { .. })));
    }

    #[tokio::test]
    async fn scrape_requires_url() {
        let tool = ScrapeTool::new(reqwest::Client::new());
        let result = tool.invoke(json!({"link": "nope"})).await;
        assert!(matches!(result, Err(ToolError::InvalidParameters { .. })));
    }
}
