//! Request/response logging with per-request trace ids.
//!
//! One exit line per request at INFO (status, latency, trace id). At DEBUG,
//! the MCP dispatch routes additionally get a one-phrase summary of the
//! JSON-RPC response body (tool counts, error codes) instead of the raw
//! payload; bodies on the token and registration endpoints are never logged.

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Cap on how much of a response body the summariser will buffer.
const MAX_SUMMARY_BODY: usize = 1024 * 1024;

fn is_mcp_path(path: &str) -> bool {
    path == "/" || path == "/mcp"
}

/// Short random id tying a request's log lines together.
fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Pull the JSON-RPC method out of a request body, if it is one.
pub(super) fn extract_rpc_method(bytes: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(bytes).ok()?;
    json.get("method")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Compress a JSON-RPC response body into one log-friendly phrase.
pub(super) fn summarize_rpc_response(bytes: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(bytes).ok()?;

    if let Some(error) = json.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Some(format!("error: {message} ({code})"));
    }

    let result = json.get("result")?;
    for (key, label) in [
        ("tools", "tools"),
        ("resources", "resources"),
        ("prompts", "prompts"),
        ("content", "content"),
    ] {
        if let Some(items) = result.get(key).and_then(Value::as_array) {
            return Some(format!("{label}: {}", items.len()));
        }
    }
    if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
        return Some(format!("initialized ({version})"));
    }
    Some("ok".to_string())
}

/// Logging middleware; applied to the whole router.
pub async fn http_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let trace_id = new_trace_id();
    let started = Instant::now();

    // At DEBUG, name the JSON-RPC method carried by an MCP request.
    let request = if is_mcp_path(&path) && tracing::enabled!(Level::DEBUG) {
        let (parts, body) = request.into_parts();
        match axum::body::to_bytes(body, MAX_SUMMARY_BODY).await {
            Ok(bytes) => {
                if let Some(rpc_method) = extract_rpc_method(&bytes) {
                    debug!(trace_id = %trace_id, method = %rpc_method, "rpc request");
                }
                Request::from_parts(parts, Body::from(bytes))
            }
            Err(_) => Request::from_parts(parts, Body::empty()),
        }
    } else {
        request
    };

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    // Summarise MCP responses at DEBUG without paying for it otherwise.
    let response = if is_mcp_path(&path) && tracing::enabled!(Level::DEBUG) {
        let (parts, body) = response.into_parts();
        match axum::body::to_bytes(body, MAX_SUMMARY_BODY).await {
            Ok(bytes) => {
                if let Some(summary) = summarize_rpc_response(&bytes) {
                    debug!(trace_id = %trace_id, response = %summary, "rpc response");
                }
                Response::from_parts(parts, Body::from(bytes))
            }
            Err(_) => Response::from_parts(parts, Body::empty()),
        }
    } else {
        response
    };

    if path == "/health" {
        debug!(trace_id = %trace_id, %method, path = %path, status, elapsed_ms, "request");
    } else {
        info!(trace_id = %trace_id, %method, path = %path, status, elapsed_ms, "request");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_rpc_method() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}"#;
        assert_eq!(extract_rpc_method(body), Some("tools/call".to_string()));
        assert_eq!(extract_rpc_method(br#"{"result":{}}"#), None);
        assert_eq!(extract_rpc_method(b"not json"), None);
    }

    #[test]
    fn test_summarize_list_responses() {
        let tools = br#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"a"},{"name":"b"}]}}"#;
        assert_eq!(summarize_rpc_response(tools), Some("tools: 2".to_string()));

        let content = br#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text"}]}}"#;
        assert_eq!(
            summarize_rpc_response(content),
            Some("content: 1".to_string())
        );
    }

    #[test]
    fn test_summarize_error_and_init() {
        let error = br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found: x"}}"#;
        assert_eq!(
            summarize_rpc_response(error),
            Some("error: Method not found: x (-32601)".to_string())
        );

        let init = br#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-11-25"}}"#;
        assert_eq!(
            summarize_rpc_response(init),
            Some("initialized (2025-11-25)".to_string())
        );

        let empty = br#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert_eq!(summarize_rpc_response(empty), Some("ok".to_string()));
    }

    #[test]
    fn test_trace_id_shape() {
        let id = new_trace_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, new_trace_id());
    }
}
