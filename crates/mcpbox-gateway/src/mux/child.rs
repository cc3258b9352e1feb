//! Startup of a single managed MCP server.
//!
//! Spawn, MCP handshake, catalogue discovery, allowlist filtering, and
//! namespacing. Failure at any step marks the server failed without touching
//! the rest of the fleet.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mcpbox_core::config::McpServerConfig;
use mcpbox_core::{namespace, GATEWAY_NAME, PROTOCOL_VERSION};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::rpc::StdioRpcClient;

/// Time allowed for spawn-to-handshake-complete.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle stages, logged as the child moves through startup and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Configured,
    Spawning,
    Handshaking,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

/// A running, handshaken child with its namespaced catalogue.
pub struct ChildHandle {
    pub name: String,
    pub client: Arc<StdioRpcClient>,
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
}

fn trace_state(name: &str, state: ChildState) {
    debug!(server = %name, state = ?state, "child state");
}

/// Spawn and handshake one configured server, returning its handle.
pub async fn start(
    name: &str,
    config: &McpServerConfig,
    mcp_debug: bool,
    redact: bool,
    skip_namespace: bool,
) -> Result<ChildHandle> {
    trace_state(name, ChildState::Configured);
    trace_state(name, ChildState::Spawning);

    let client = Arc::new(StdioRpcClient::spawn(
        name,
        &config.command,
        &config.args,
        &config.env,
        mcp_debug,
        redact,
    )?);

    trace_state(name, ChildState::Handshaking);
    let handshake = async {
        client
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": GATEWAY_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await
            .map_err(|e| anyhow::anyhow!("initialize failed: {e}"))?;
        client
            .notify("notifications/initialized", None)
            .await
            .context("initialized notification failed")?;
        Ok::<_, anyhow::Error>(())
    };
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = client.shutdown().await;
            return Err(e);
        }
        Err(_) => {
            let _ = client.shutdown().await;
            bail!("handshake timed out after {HANDSHAKE_TIMEOUT:?}");
        }
    }

    // tools/list is mandatory; a server without it is not served.
    let tools_result = client
        .request("tools/list", None)
        .await
        .map_err(|e| anyhow::anyhow!("tools/list failed: {e}"))?;
    let discovered = as_array(&tools_result, "tools");
    let tools = filter_and_namespace_tools(name, discovered, config.tools.as_deref(), skip_namespace);

    // resources/list and prompts/list are optional capabilities.
    let resources = match client.request("resources/list", None).await {
        Ok(result) => namespace_descriptors(name, as_array(&result, "resources"), "uri", skip_namespace),
        Err(e) => {
            debug!(server = %name, error = %e, "resources/list unavailable");
            Vec::new()
        }
    };
    let prompts = match client.request("prompts/list", None).await {
        Ok(result) => namespace_descriptors(name, as_array(&result, "prompts"), "name", skip_namespace),
        Err(e) => {
            debug!(server = %name, error = %e, "prompts/list unavailable");
            Vec::new()
        }
    };

    trace_state(name, ChildState::Ready);
    info!(
        server = %name,
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "server connected"
    );

    Ok(ChildHandle {
        name: name.to_string(),
        client,
        tools,
        resources,
        prompts,
    })
}

fn as_array(result: &Value, key: &str) -> Vec<Value> {
    result
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Apply the configured allowlist, then qualify the surviving tool names.
fn filter_and_namespace_tools(
    server: &str,
    discovered: Vec<Value>,
    allowlist: Option<&[String]>,
    skip_namespace: bool,
) -> Vec<Value> {
    let kept: Vec<Value> = match allowlist {
        None => discovered,
        Some(allowed) => {
            let discovered_names: Vec<&str> = discovered
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .collect();
            for entry in allowed {
                if !discovered_names.contains(&entry.as_str()) {
                    warn!(server, tool = %entry, "allowlisted tool not offered by server");
                }
            }
            discovered
                .into_iter()
                .filter(|tool| {
                    tool.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|name| allowed.iter().any(|a| a == name))
                })
                .collect()
        }
    };

    namespace_descriptors(server, kept, "name", skip_namespace)
}

/// Rewrite the identifying field of each descriptor through the codec.
fn namespace_descriptors(
    server: &str,
    descriptors: Vec<Value>,
    id_field: &str,
    skip_namespace: bool,
) -> Vec<Value> {
    if skip_namespace {
        return descriptors;
    }
    descriptors
        .into_iter()
        .map(|mut descriptor| {
            if let Some(original) = descriptor.get(id_field).and_then(Value::as_str) {
                let qualified = namespace::encode(server, original);
                descriptor[id_field] = Value::String(qualified);
            }
            descriptor
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": "d", "inputSchema": {"type": "object"}})
    }

    #[test]
    fn test_namespace_rewrite() {
        let out = namespace_descriptors("mock", vec![tool("echo"), tool("add")], "name", false);
        assert_eq!(out[0]["name"], "mock__echo");
        assert_eq!(out[1]["name"], "mock__add");
        // Non-identifying fields survive untouched.
        assert_eq!(out[0]["description"], "d");
    }

    #[test]
    fn test_namespace_skip_passthrough() {
        let out = namespace_descriptors("mock", vec![tool("echo")], "name", true);
        assert_eq!(out[0]["name"], "echo");
    }

    #[test]
    fn test_allowlist_filters() {
        let allowed = vec!["echo".to_string(), "ghost".to_string()];
        let out = filter_and_namespace_tools(
            "mock",
            vec![tool("echo"), tool("add")],
            Some(&allowed),
            false,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["name"], "mock__echo");
    }

    #[test]
    fn test_no_allowlist_keeps_all() {
        let out = filter_and_namespace_tools("mock", vec![tool("a"), tool("b")], None, false);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_resource_uri_rewrite() {
        let resources = vec![json!({"uri": "file:///notes.txt", "name": "notes"})];
        let out = namespace_descriptors("mock", resources, "uri", false);
        assert_eq!(out[0]["uri"], "mock__file:///notes.txt");
        assert_eq!(out[0]["name"], "notes");
    }
}
