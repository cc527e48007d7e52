//! HTTP-backed tools configured at runtime.
//!
//! A webhook tool POSTs its arguments as JSON and returns the response body to the
//! model. Non-2xx responses are failures.

use super::{ExternalToolDefinition, ToolHandler, ToolRegistry, ToolRequest};
use crate::error::ToolError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct WebhookToolHandler {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookToolHandler {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Http(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ToolHandler for WebhookToolHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: ToolRequest) -> Result<String, ToolError> {
        let body = request.to_arguments();
        debug!(tool = %self.name, url = %self.url, "POST webhook tool");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ToolError::Http(format!("{} returned {}: {}", self.url, status, text)));
        }
        Ok(text)
    }
}

/// Register a webhook handler for every definition that names a URL.
///
/// Definitions without a URL are skipped; the caller is expected to register a
/// handler for them directly. Returns the number of handlers registered.
pub fn register_webhook_tools(
    registry: &mut ToolRegistry,
    definitions: &[ExternalToolDefinition],
) -> Result<usize, ToolError> {
    let mut registered = 0;
    for def in definitions {
        let Some(url) = def.url.as_deref() else {
            warn!(tool = %def.name, "external tool has no url; register a handler for it manually");
            continue;
        };
        let handler = WebhookToolHandler::new(&def.name, url, Duration::from_millis(def.timeout_ms))?;
        registry.register_with_declaration(def.declaration(), Arc::new(handler));
        registered += 1;
    }
    if registered > 0 {
        info!("🔧 Registered {} webhook tool(s)", registered);
    }
    Ok(registered)
}
