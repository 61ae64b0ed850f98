//! HTTP surface
//!
//! | Route | Methods | Body |
//! |---|---|---|
//! | `/health` | GET | - |
//! | `/mcp/list_tools` | GET, POST | - |
//! | `/mcp/call_tool` | POST | `{"name": "...", "arguments": {...}}` |
//!
//! Bridge calls block, so each request hands its call to tokio's blocking
//! pool and awaits the result there. Every response body is JSON, errors
//! included (`{"error": "..."}`).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::model::{CallToolResult, JsonObject, ListToolsResult, Tool};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::bridge::RequestBridge;
use crate::config::ServerConfig;
use crate::error::WrapperError;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<RequestBridge>,
    pub server: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(bridge: Arc<RequestBridge>, server: ServerConfig) -> Self {
        Self {
            bridge,
            server: Arc::new(server),
        }
    }
}

/// Build the wrapper's router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health).fallback(method_not_allowed))
        .route(
            "/mcp/list_tools",
            get(list_tools).post(list_tools).fallback(method_not_allowed),
        )
        .route("/mcp/call_tool", post(call_tool).fallback(method_not_allowed))
        .fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Response bodies
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub mcp_server: McpServerSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerSummary {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl From<&Tool> for ToolSummary {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.as_deref().unwrap_or_default().to_string(),
            input_schema: Value::Object((*tool.input_schema).clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListToolsResponse {
    pub tools: Vec<ToolSummary>,
}

impl From<&ListToolsResult> for ListToolsResponse {
    fn from(result: &ListToolsResult) -> Self {
        Self {
            tools: result.tools.iter().map(ToolSummary::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentItem {
    /// Flatten one wire-format content item. Items without a `text` field
    /// (images, resources, ...) carry their JSON rendering as text.
    fn from_wire(item: &Value) -> Self {
        let kind = item
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let text = match item.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => item.to_string(),
        };
        Self { kind, text }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallToolResponse {
    pub content: Vec<ContentItem>,
}

impl CallToolResponse {
    fn from_result(result: &CallToolResult) -> Result<Self, WrapperError> {
        // Content is a tagged union; its wire form gives us `type` for every variant
        let rendered = serde_json::to_value(result)
            .map_err(|e| WrapperError::Protocol(format!("unreadable tool result: {}", e)))?;

        let content = rendered
            .get("content")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(ContentItem::from_wire).collect())
            .unwrap_or_default();

        Ok(Self { content })
    }
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct CallToolBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

impl CallToolBody {
    fn parse(body: &[u8]) -> Result<Self, WrapperError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| WrapperError::invalid_request(format!("Invalid JSON body: {}", e)))
    }

    /// The tool name, rejecting a missing or empty one
    fn name(&self) -> Result<&str, WrapperError> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(WrapperError::invalid_request("Tool name is required")),
        }
    }

    /// Tool arguments; absent or `null` means no arguments
    fn arguments(&self) -> Result<JsonObject, WrapperError> {
        match &self.arguments {
            None | Some(Value::Null) => Ok(JsonObject::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(WrapperError::invalid_request(
                "Tool arguments must be a JSON object",
            )),
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.server.service_name(),
        mcp_server: McpServerSummary {
            command: state.server.command.clone(),
            args: state.server.args.clone(),
        },
    })
}

async fn list_tools(
    State(state): State<AppState>,
) -> Result<Json<ListToolsResponse>, WrapperError> {
    let bridge = state.bridge.clone();
    match on_request_thread(move || bridge.list_tools()).await {
        Ok(result) => {
            tracing::debug!("Listing {} tools", result.tools.len());
            Ok(Json(ListToolsResponse::from(&result)))
        }
        Err(e) => {
            tracing::error!("Error listing tools: {}", e);
            Err(e)
        }
    }
}

async fn call_tool(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CallToolResponse>, WrapperError> {
    let request = CallToolBody::parse(&body)?;
    let name = request.name()?.to_string();
    let arguments = request.arguments()?;

    tracing::debug!("Calling tool: {} with {} argument(s)", name, arguments.len());

    let bridge = state.bridge.clone();
    let tool = name.clone();
    let outcome = on_request_thread(move || bridge.call_tool(tool, arguments))
        .await
        .and_then(|result| CallToolResponse::from_result(&result));

    match outcome {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!("Error calling tool {}: {}", name, e);
            Err(e)
        }
    }
}

/// Run a blocking bridge call on the blocking pool
async fn on_request_thread<T, F>(call: F) -> Result<T, WrapperError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WrapperError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| WrapperError::ContextUnavailable(format!("request thread failed: {}", e)))?
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
}

async fn not_found(request: Request) -> impl IntoResponse {
    tracing::warn!("Unmatched route: {} {}", request.method(), request.uri());
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

/// Middleware to log HTTP requests
async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::debug!(
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "{} {}",
        method,
        uri
    );
    response
}
