//! Serving side of the protocol: this process as the tool provider.
//!
//! Receives one protocol message at a time and returns a response or
//! nothing. Messages without an id are notifications: they are processed but
//! never answered, even when the method is unrecognized. An optional
//! authorization hook runs ahead of `tools/call` and `resources/read` only.

use crate::logging;
use crate::protocol::*;
use crate::registry::{ServedResource, ServedTool};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Authorization hook. Token semantics are the embedder's concern; the
/// dispatcher only defines where the check runs.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, method: &str, params: &Value) -> bool;
}

pub type ToolSet = Vec<Arc<dyn ServedTool>>;
pub type ResourceSet = Vec<Arc<dyn ServedResource>>;
type ToolBuilder = Box<dyn Fn() -> ToolSet + Send + Sync>;
type ResourceBuilder = Box<dyn Fn() -> ResourceSet + Send + Sync>;

pub struct ServerDispatcher {
    server_name: String,
    server_version: String,
    tool_builder: ToolBuilder,
    resource_builder: ResourceBuilder,
    /// Registries are built lazily on first use: a process that never
    /// receives a listing or invocation pays no construction cost.
    tools: OnceLock<HashMap<String, Arc<dyn ServedTool>>>,
    resources: OnceLock<HashMap<String, Arc<dyn ServedResource>>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    dropped: AtomicU64,
}

impl ServerDispatcher {
    pub fn new(server_name: impl Into<String>, server_version: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_version: server_version.into(),
            tool_builder: Box::new(Vec::new),
            resource_builder: Box::new(Vec::new),
            tools: OnceLock::new(),
            resources: OnceLock::new(),
            authorizer: None,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_tools(mut self, builder: impl Fn() -> ToolSet + Send + Sync + 'static) -> Self {
        self.tool_builder = Box::new(builder);
        self
    }

    pub fn with_resources(
        mut self,
        builder: impl Fn() -> ResourceSet + Send + Sync + 'static,
    ) -> Self {
        self.resource_builder = Box::new(builder);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Messages dropped without a response: invalid envelopes and unknown
    /// methods arriving as notifications.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Handle one protocol message. Returns the serialized response for
    /// requests, `None` for notifications.
    pub async fn handle(&self, message: Value) -> Option<Value> {
        let id = message.get("id").cloned().filter(|id| !id.is_null());

        let version_ok = message.get("jsonrpc").and_then(Value::as_str) == Some("2.0");
        let method = message.get("method").and_then(Value::as_str);
        let (Some(method), true) = (method, version_ok) else {
            return match id {
                Some(id) => Some(error_response(id, INVALID_REQUEST, "invalid request")),
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    logging::debug("dropped invalid envelope without id");
                    None
                }
            };
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        // The check runs for notifications too; a failed check drops them.
        if matches!(method, "tools/call" | "resources/read") {
            if let Some(authorizer) = &self.authorizer {
                if !authorizer.authorize(method, &params).await {
                    return match id {
                        Some(id) => Some(error_response(id, UNAUTHORIZED, "authorization failed")),
                        None => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            None
                        }
                    };
                }
            }
        }

        let outcome: Result<Value, (i64, String)> = match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": self.server_name, "version": self.server_version},
            })),
            "notifications/initialized" => Ok(Value::Null),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.tool_listing()})),
            "tools/call" => self.call_tool(&params).await,
            "resources/list" => Ok(json!({"resources": self.resource_listing()})),
            "resources/read" => self.read_resource(&params).await,
            other => Err((METHOD_NOT_FOUND, format!("method not found: {}", other))),
        };

        let Some(id) = id else {
            if outcome.is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                logging::debug(&format!("dropped notification '{}'", method));
            }
            return None;
        };
        Some(match outcome {
            Ok(result) => success_response(id, result),
            Err((code, message)) => error_response(id, code, &message),
        })
    }

    /// Execute a tool. Sync and deferred implementations both arrive here as
    /// futures; the awaited literal return value becomes the payload.
    async fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "missing tool name".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let tool = self
            .tool_registry()
            .get(name)
            .ok_or((INVALID_PARAMS, format!("unknown tool '{}'", name)))?;
        tool.execute(arguments)
            .await
            .map_err(|e| (INTERNAL_ERROR, format!("{:#}", e)))
    }

    async fn read_resource(&self, params: &Value) -> Result<Value, (i64, String)> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "missing resource uri".to_string()))?;
        let resource = self
            .resource_registry()
            .get(uri)
            .ok_or((INVALID_PARAMS, format!("unknown resource '{}'", uri)))?;
        resource
            .read()
            .await
            .map_err(|e| (INTERNAL_ERROR, format!("{:#}", e)))
    }

    fn tool_registry(&self) -> &HashMap<String, Arc<dyn ServedTool>> {
        self.tools.get_or_init(|| {
            (self.tool_builder)()
                .into_iter()
                .map(|tool| (tool.name().to_string(), tool))
                .collect()
        })
    }

    fn resource_registry(&self) -> &HashMap<String, Arc<dyn ServedResource>> {
        self.resources.get_or_init(|| {
            (self.resource_builder)()
                .into_iter()
                .map(|resource| (resource.uri().to_string(), resource))
                .collect()
        })
    }

    fn tool_listing(&self) -> Vec<ToolDef> {
        let mut tools: Vec<ToolDef> = self
            .tool_registry()
            .values()
            .map(|tool| ToolDef {
                name: tool.name().to_string(),
                description: Some(tool.description().to_string()),
                input_schema: tool.input_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    fn resource_listing(&self) -> Vec<ResourceDef> {
        let mut resources: Vec<ResourceDef> = self
            .resource_registry()
            .values()
            .map(|resource| ResourceDef {
                uri: resource.uri().to_string(),
                name: resource.name().to_string(),
                description: resource.description().map(str::to_string),
                mime_type: Some(resource.mime_type().to_string()),
            })
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
