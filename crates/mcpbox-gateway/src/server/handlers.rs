//! HTTP handlers: health, icons, child status, and the JSON-RPC dispatch.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::jsonrpc::{self, Request, Response as RpcResponse};
use crate::mux::MuxError;

/// 1x1 transparent PNG served for every icon route.
const ICON_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// `GET /health`
pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /logo.png` (and the other icon aliases)
pub(super) async fn icon() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=86400"),
        ],
        ICON_PNG,
    )
        .into_response()
}

/// `GET /status`: per-child health (protected).
pub(super) async fn status(State(state): State<AppState>) -> Json<Value> {
    let servers = state.mux.health().await;
    Json(json!({ "status": "ok", "servers": servers }))
}

/// 404 fallback.
pub(super) async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Not found" })),
    )
        .into_response()
}

/// `POST /` and `POST /mcp`: the JSON-RPC dispatch (protected).
pub(super) async fn mcp(State(state): State<AppState>, body: String) -> Response {
    // A body that is not JSON at all is a transport-level failure.
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) => {
            let envelope = RpcResponse::error(Value::Null, jsonrpc::PARSE_ERROR, "Parse error");
            return (StatusCode::BAD_REQUEST, Json(envelope)).into_response();
        }
    };

    let request: Request = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => {
            let envelope =
                RpcResponse::error(Value::Null, jsonrpc::INVALID_REQUEST, "Invalid request");
            return (StatusCode::OK, Json(envelope)).into_response();
        }
    };

    if !request.is_valid() {
        let id = request.id.clone().unwrap_or(Value::Null);
        let envelope = RpcResponse::error(id, jsonrpc::INVALID_REQUEST, "Invalid request");
        return (StatusCode::OK, Json(envelope)).into_response();
    }

    // Notifications get acknowledged and dropped; this transport never
    // streams anything back.
    if request.is_notification() {
        debug!(method = %request.method, "notification acknowledged");
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    let envelope = match dispatch(&state, &request).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(DispatchError::MethodNotFound(method)) => RpcResponse::error(
            id,
            jsonrpc::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        ),
        Err(DispatchError::InvalidParams(message)) => {
            RpcResponse::error(id, jsonrpc::INVALID_PARAMS, message)
        }
        Err(DispatchError::Mux(e)) => {
            RpcResponse::error(id, jsonrpc::INTERNAL_ERROR, e.to_string())
        }
    };
    (StatusCode::OK, Json(envelope)).into_response()
}

enum DispatchError {
    MethodNotFound(String),
    InvalidParams(String),
    Mux(MuxError),
}

impl From<MuxError> for DispatchError {
    fn from(error: MuxError) -> Self {
        DispatchError::Mux(error)
    }
}

async fn dispatch(state: &AppState, request: &Request) -> Result<Value, DispatchError> {
    let params = request.params.clone().unwrap_or(Value::Null);
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": mcpbox_core::PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "listChanged": true },
                "prompts": { "listChanged": true },
                "completions": {}
            },
            "serverInfo": {
                "name": mcpbox_core::GATEWAY_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": state.mux.list_tools() })),
        "tools/call" => {
            let name = require_str(&params, "name")?;
            let arguments = params.get("arguments").cloned();
            Ok(state.mux.call_tool(&name, arguments).await?)
        }
        "resources/list" => Ok(json!({ "resources": state.mux.list_resources() })),
        "resources/read" => {
            let uri = require_str(&params, "uri")?;
            Ok(state.mux.read_resource(&uri).await?)
        }
        "prompts/list" => Ok(json!({ "prompts": state.mux.list_prompts() })),
        "prompts/get" => {
            let name = require_str(&params, "name")?;
            let arguments = params.get("arguments").cloned();
            Ok(state.mux.get_prompt(&name, arguments).await?)
        }
        "completion/complete" => Ok(state.mux.complete(params).await?),
        other => Err(DispatchError::MethodNotFound(other.to_string())),
    }
}

fn require_str(params: &Value, key: &str) -> Result<String, DispatchError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| DispatchError::InvalidParams(format!("missing required parameter: {key}")))
}
