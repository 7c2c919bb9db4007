//! Generic HTTP connector tools.
//!
//! Messaging, email and sandboxed execution all live behind external
//! connector services with the same shape: POST the tool arguments as
//! JSON, return the response body. One implementation, several
//! registrations.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::tool::Tool;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A tool backed by an external HTTP connector.
pub struct HttpConnectorTool {
    name: String,
    description: String,
    schema: Value,
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpConnectorTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        client: reqwest::Client,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            client,
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a message to a chat channel. Not idempotent: a retry after
    /// an ambiguous failure could double-send.
    pub fn messaging_send(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self::new(
            "messaging_send",
            "Send a message to a chat channel.",
            json!({
                "type": "object",
                "properties": {
                    "channel": {"type": "string", "description": "Channel name or id"},
                    "text": {"type": "string", "description": "Message body"}
                },
                "required": ["channel", "text"]
            }),
            client,
            endpoint,
        )
    }

    /// Read recent messages from a mailbox.
    pub fn email_read(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self::new(
            "email_read",
            "Read recent emails from the connected mailbox.",
            json!({
                "type": "object",
                "properties": {
                    "folder": {"type": "string", "description": "Mailbox folder, default INBOX"},
                    "limit": {"type": "integer", "description": "Max messages to return"}
                }
            }),
            client,
            endpoint,
        )
    }

    /// Run code in the remote sandbox.
    pub fn sandbox_exec(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self::new(
            "sandbox_exec",
            "Execute code in an isolated sandbox and return stdout/stderr.",
            json!({
                "type": "object",
                "properties": {
                    "language": {"type": "string", "description": "Language, e.g. python"},
                    "code": {"type": "string", "description": "Source to execute"}
                },
                "required": ["code"]
            }),
            client,
            endpoint,
        )
    }
}

#[async_trait]
impl Tool for HttpConnectorTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let request = self.client.post(&self.endpoint).json(&args).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ToolError::Timeout {
                name: self.name.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ToolError::ExecutionFailed {
                name: self.name.clone(),
                reason: format!("connector returned HTTP {status}: {body}"),
            });
        }
        Ok(body)
    }
}
