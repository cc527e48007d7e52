//! Tool calls issued by the voice model mid-conversation.
//!
//! Built-in tools get their arguments parsed into a typed [`ToolRequest`] before a
//! handler runs, so malformed arguments are a single branch here instead of checks
//! scattered through handlers. Every [`ToolCall`] produces exactly one
//! [`ToolResult`]; failures are encoded in the payload.

use crate::error::ToolError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod webhook;

pub use webhook::{register_webhook_tools, WebhookToolHandler};

pub const SAVE_MEMORY: &str = "save_memory";
pub const CREATE_REMINDER: &str = "create_reminder";
pub const COMPLETE_REMINDER: &str = "complete_reminder";
pub const WEB_SEARCH: &str = "web_search";

/// A function call from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub correlation_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    /// Build a call whose arguments arrived as a JSON string. Unparseable text is kept
    /// as a string value so argument validation reports it.
    pub fn from_json_arguments(
        correlation_id: impl Into<String>,
        name: impl Into<String>,
        arguments: &str,
    ) -> Self {
        let arguments = if arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
        };
        Self {
            correlation_id: correlation_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The response sent back to the model for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub correlation_id: String,
    pub name: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMemoryArgs {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateReminderArgs {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteReminderArgs {
    pub reminder_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchArgs {
    pub query: String,
}

/// Validated arguments, one variant per built-in tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    SaveMemory(SaveMemoryArgs),
    CreateReminder(CreateReminderArgs),
    CompleteReminder(CompleteReminderArgs),
    WebSearch(WebSearchArgs),
    /// A dynamically configured tool; arguments pass through untouched.
    External { name: String, arguments: Value },
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T, ToolError> {
    if !arguments.is_object() {
        return Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: "arguments must be a JSON object".to_string(),
        });
    }
    serde_json::from_value(arguments.clone()).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn require_text(tool: &str, field: &str, value: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("field `{}` must not be empty", field),
        });
    }
    Ok(())
}

impl ToolRequest {
    /// Parse raw arguments for `name`. Unknown names become `External`.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self, ToolError> {
        match name {
            SAVE_MEMORY => {
                let args: SaveMemoryArgs = parse_args(name, arguments)?;
                require_text(name, "content", &args.content)?;
                Ok(Self::SaveMemory(args))
            }
            CREATE_REMINDER => {
                let args: CreateReminderArgs = parse_args(name, arguments)?;
                require_text(name, "text", &args.text)?;
                Ok(Self::CreateReminder(args))
            }
            COMPLETE_REMINDER => {
                let args: CompleteReminderArgs = parse_args(name, arguments)?;
                require_text(name, "reminder_id", &args.reminder_id)?;
                Ok(Self::CompleteReminder(args))
            }
            WEB_SEARCH => {
                let args: WebSearchArgs = parse_args(name, arguments)?;
                require_text(name, "query", &args.query)?;
                Ok(Self::WebSearch(args))
            }
            other => Ok(Self::External {
                name: other.to_string(),
                arguments: arguments.clone(),
            }),
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            Self::SaveMemory(_) => SAVE_MEMORY,
            Self::CreateReminder(_) => CREATE_REMINDER,
            Self::CompleteReminder(_) => COMPLETE_REMINDER,
            Self::WebSearch(_) => WEB_SEARCH,
            Self::External { name, .. } => name,
        }
    }

    /// Arguments as a JSON object (for handlers that forward them).
    pub fn to_arguments(&self) -> Value {
        let value = match self {
            Self::SaveMemory(a) => serde_json::to_value(a),
            Self::CreateReminder(a) => serde_json::to_value(a),
            Self::CompleteReminder(a) => serde_json::to_value(a),
            Self::WebSearch(a) => serde_json::to_value(a),
            Self::External { arguments, .. } => return arguments.clone(),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Function declaration negotiated with the model at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments object
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDeclaration {
    /// Declaration for a built-in tool, if `name` is one.
    pub fn builtin(name: &str) -> Option<Self> {
        let (description, parameters) = match name {
            SAVE_MEMORY => (
                "Save a fact about the user for future conversations.",
                json!({
                    "type": "object",
                    "properties": {
                        "content": { "type": "string", "description": "The fact to remember" },
                        "category": { "type": "string" }
                    },
                    "required": ["content"]
                }),
            ),
            CREATE_REMINDER => (
                "Create a reminder for the user.",
                json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "due_at": { "type": "string", "description": "RFC 3339 timestamp" }
                    },
                    "required": ["text"]
                }),
            ),
            COMPLETE_REMINDER => (
                "Mark an existing reminder as done.",
                json!({
                    "type": "object",
                    "properties": { "reminder_id": { "type": "string" } },
                    "required": ["reminder_id"]
                }),
            ),
            WEB_SEARCH => (
                "Search the web and summarise the results.",
                json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
            ),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        })
    }
}

/// A dynamically configured tool, typically from `[[tools]]` in the engine config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
    /// When set, calls are POSTed here by [`WebhookToolHandler`].
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_tool_timeout_ms() -> u64 {
    10_000
}

impl ExternalToolDefinition {
    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// A capability the model can invoke by name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Unique tool name for routing.
    fn name(&self) -> &str;

    /// Run the tool. The returned string is sent back to the model verbatim.
    async fn call(&self, request: ToolRequest) -> Result<String, ToolError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnTool<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(ToolRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: ToolRequest) -> Result<String, ToolError> {
        (self.f)(request).await
    }
}

/// Wrap an async closure as a shareable tool handler.
pub fn tool_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
{
    Arc::new(FnTool {
        name: name.into(),
        f,
    })
}

struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    declaration: ToolDeclaration,
}

/// Registry of tool handlers that can be dispatched by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Built-in names get their stock declaration; other names a
    /// bare object schema. A later registration replaces an earlier one of the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let declaration =
            ToolDeclaration::builtin(handler.name()).unwrap_or_else(|| ToolDeclaration {
                name: handler.name().to_string(),
                description: String::new(),
                parameters: empty_object_schema(),
            });
        self.register_with_declaration(declaration, handler);
    }

    pub fn register_with_declaration(
        &mut self,
        declaration: ToolDeclaration,
        handler: Arc<dyn ToolHandler>,
    ) {
        self.tools.retain(|t| t.handler.name() != handler.name());
        self.tools.push(RegisteredTool {
            handler,
            declaration,
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools
            .iter()
            .find(|t| t.handler.name() == name)
            .map(|t| Arc::clone(&t.handler))
    }

    /// Returns the names of all registered tools.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.handler.name().to_string()).collect()
    }

    /// Declarations to negotiate with the transport.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.iter().map(|t| t.declaration.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Route `call` to its handler and always produce exactly one result.
pub async fn dispatch(call: ToolCall, registry: &ToolRegistry) -> ToolResult {
    let ToolCall {
        correlation_id,
        name,
        arguments,
    } = call;

    let payload = match registry.get(&name) {
        None => {
            warn!(tool = %name, correlation_id = %correlation_id, "tool not found");
            format!("Tool '{}' not found", name)
        }
        Some(handler) => match ToolRequest::parse(&name, &arguments) {
            Err(e) => {
                warn!(tool = %name, correlation_id = %correlation_id, "malformed tool arguments: {}", e);
                format!("Error: {}", e)
            }
            Ok(request) => match AssertUnwindSafe(handler.call(request)).catch_unwind().await {
                Ok(Ok(output)) => {
                    debug!(tool = %name, correlation_id = %correlation_id, "tool succeeded");
                    output
                }
                Ok(Err(e)) => {
                    warn!(tool = %name, correlation_id = %correlation_id, "tool failed: {}", e);
                    format!("Error executing {}: {}", name, e)
                }
                Err(_) => {
                    warn!(tool = %name, correlation_id = %correlation_id, "tool handler panicked");
                    format!("Error executing {}: handler panicked", name)
                }
            },
        },
    };

    ToolResult {
        correlation_id,
        name,
        payload,
    }
}
