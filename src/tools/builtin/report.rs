//! Report persistence tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::store::Datastore;
use crate::tools::tool::{Tool, require_str};

/// Save a titled report to the datastore.
pub struct ReportSaveTool {
    store: Arc<dyn Datastore>,
}

impl ReportSaveTool {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ReportSaveTool {
    fn name(&self) -> &str {
        "report_save"
    }

    fn description(&self) -> &str {
        "Persist a finished report so it can be retrieved later."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "Report title"},
                "content": {"type": "string", "description": "Report body (markdown)"}
            },
            "required": ["title", "content"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let title = require_str(&args, "title", self.name())?;
        let content = require_str(&args, "content", self.name())?;

        let id = self
            .store
            .save_report(title, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        Ok(format!("Report saved with id {id}"))
    }
}
