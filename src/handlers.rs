use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::McpError;
use crate::mcp::{McpManager, ServerDefinition};

pub type AppState = Arc<McpManager>;

/// Failures of the HTTP binding: bad input, or whatever the manager reported.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    Mcp(McpError),
}

impl From<McpError> for ApiError {
    fn from(err: McpError) -> Self {
        ApiError::Mcp(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": message,
                    "code": "INVALID_REQUEST"
                })),
            )
                .into_response(),
            ApiError::Mcp(err) => err.into_response(),
        }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(manager: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/mcp/connect", post(connect))
        .route("/api/mcp/disconnect", post(disconnect))
        .route("/api/mcp/status", get(status))
        .route("/api/mcp/health", get(health_report))
        .route("/api/mcp/test-connection", post(test_connection))
        .route("/api/mcp/tools", get(list_tools).post(invoke_tool))
        .route("/api/mcp/prompts", get(list_prompts).post(fetch_prompt))
        .route("/api/mcp/resources", get(list_resources).post(read_resource))
        .with_state(manager)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerQuery {
    #[serde(default)]
    pub server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRequest {
    #[serde(default)]
    pub server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub prompt_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

fn required(value: Option<String>, message: &'static str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ApiError::BadRequest(message))
}

fn arguments_or_empty(arguments: Option<Value>) -> Value {
    arguments
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

pub async fn health_check(State(manager): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "connections": manager.list_connections().len()
    }))
}

pub async fn connect(
    State(manager): State<AppState>,
    Json(definition): Json<ServerDefinition>,
) -> ApiResult {
    info!(server = %definition.id, transport = %definition.transport, "Connect requested");
    let connection = manager.connect(&definition).await?;
    Ok(Json(json!({ "success": true, "connection": connection })))
}

pub async fn disconnect(
    State(manager): State<AppState>,
    Json(request): Json<ServerRequest>,
) -> ApiResult {
    let server_id = required(request.server_id, "Server ID is required")?;
    manager.disconnect(&server_id).await;
    Ok(Json(json!({
        "success": true,
        "message": format!("Disconnected from server {}", server_id)
    })))
}

pub async fn status(State(manager): State<AppState>) -> ApiResult {
    Ok(Json(json!({
        "success": true,
        "connections": manager.list_connections()
    })))
}

pub async fn health_report(State(manager): State<AppState>) -> ApiResult {
    let report = manager.health_report().await;
    Ok(Json(json!({
        "success": true,
        "healthChecks": report.health_checks,
        "summary": report.summary
    })))
}

pub async fn test_connection(
    State(manager): State<AppState>,
    Json(request): Json<ServerRequest>,
) -> ApiResult {
    let server_id = required(request.server_id, "Server ID is required")?;
    let report = manager.probe(&server_id).await?;
    Ok(Json(json!({ "success": true, "result": report })))
}

pub async fn list_tools(
    State(manager): State<AppState>,
    Query(query): Query<ServerQuery>,
) -> ApiResult {
    let server_id = required(query.server_id, "Server ID is required")?;
    let tools = manager.list_tools(&server_id).await?;
    Ok(Json(json!({ "success": true, "tools": tools })))
}

pub async fn invoke_tool(
    State(manager): State<AppState>,
    Json(request): Json<ToolCallRequest>,
) -> ApiResult {
    let server_id = required(request.server_id, "Server ID and tool name are required")?;
    let tool_name = required(request.tool_name, "Server ID and tool name are required")?;
    let result = manager
        .invoke_tool(&server_id, &tool_name, arguments_or_empty(request.arguments))
        .await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

pub async fn list_prompts(
    State(manager): State<AppState>,
    Query(query): Query<ServerQuery>,
) -> ApiResult {
    let server_id = required(query.server_id, "Server ID is required")?;
    let prompts = manager.list_prompts(&server_id).await?;
    Ok(Json(json!({ "success": true, "prompts": prompts })))
}

pub async fn fetch_prompt(
    State(manager): State<AppState>,
    Json(request): Json<PromptRequest>,
) -> ApiResult {
    let server_id = required(request.server_id, "Server ID and prompt name are required")?;
    let prompt_name = required(request.prompt_name, "Server ID and prompt name are required")?;
    let result = manager
        .fetch_prompt(&server_id, &prompt_name, arguments_or_empty(request.arguments))
        .await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

pub async fn list_resources(
    State(manager): State<AppState>,
    Query(query): Query<ServerQuery>,
) -> ApiResult {
    let server_id = required(query.server_id, "Server ID is required")?;
    let resources = manager.list_resources(&server_id).await?;
    Ok(Json(json!({ "success": true, "resources": resources })))
}

pub async fn read_resource(
    State(manager): State<AppState>,
    Json(request): Json<ResourceRequest>,
) -> ApiResult {
    let server_id = required(request.server_id, "Server ID and URI are required")?;
    let uri = required(request.uri, "Server ID and URI are required")?;
    let result = manager.read_resource(&server_id, &uri).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}
