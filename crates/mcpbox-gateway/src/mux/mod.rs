//! The MCP multiplexer.
//!
//! Owns every managed child, the merged catalogue, and the routing indexes
//! that map a qualified tool name / resource URI / prompt name back to the
//! child that offers it. The indexes are built at startup and cleared at
//! shutdown; in between they are only read.

mod child;
mod rpc;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mcpbox_core::config::McpServerConfig;
use mcpbox_core::namespace;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub use child::{ChildHandle, ChildState};
pub use rpc::StdioRpcClient;

use crate::jsonrpc::RpcError;

/// Routing failures, all surfaced as JSON-RPC `-32603`.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Unknown resource: {0}")]
    UnknownResource(String),
    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),
    #[error("{0}")]
    Downstream(String),
}

impl From<RpcError> for MuxError {
    fn from(error: RpcError) -> Self {
        MuxError::Downstream(error.message)
    }
}

/// Which routing index a lookup goes through.
#[derive(Debug, Clone, Copy)]
enum CatalogueKind {
    Tool,
    Resource,
    Prompt,
}

/// Per-child health report for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ChildHealth {
    pub name: String,
    pub status: &'static str,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

#[derive(Default)]
struct MuxState {
    /// Children in startup order; list operations concatenate in this order.
    order: Vec<String>,
    children: HashMap<String, Arc<ChildHandle>>,
    tool_index: HashMap<String, String>,
    resource_index: HashMap<String, String>,
    prompt_index: HashMap<String, String>,
}

impl MuxState {
    fn index(&self, kind: CatalogueKind) -> &HashMap<String, String> {
        match kind {
            CatalogueKind::Tool => &self.tool_index,
            CatalogueKind::Resource => &self.resource_index,
            CatalogueKind::Prompt => &self.prompt_index,
        }
    }
}

pub struct Multiplexer {
    state: RwLock<MuxState>,
    skip_namespace: bool,
    shutting_down: AtomicBool,
}

impl Multiplexer {
    /// Spawn and handshake every configured server concurrently.
    ///
    /// A server that fails to start is logged and skipped; the gateway runs
    /// with whatever came up. An empty fleet is legal.
    pub async fn start(
        configs: &HashMap<String, McpServerConfig>,
        mcp_debug: bool,
        redact: bool,
    ) -> Arc<Self> {
        let skip_namespace = std::env::var(mcpbox_core::SKIP_NAMESPACE_ENV).is_ok();
        if skip_namespace {
            warn!(
                "namespacing disabled via {}",
                mcpbox_core::SKIP_NAMESPACE_ENV
            );
        }

        let mut join_set = JoinSet::new();
        for (name, config) in configs {
            let name = name.clone();
            let config = config.clone();
            join_set.spawn(async move {
                let result = child::start(&name, &config, mcp_debug, redact, skip_namespace).await;
                (name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => error!(error = %e, "server startup task panicked"),
            }
        }
        // Deterministic catalogue order regardless of which child came up
        // first.
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut state = MuxState::default();
        let mut failed = 0usize;
        for (name, result) in results {
            match result {
                Ok(handle) => index_child(&mut state, handle),
                Err(e) => {
                    failed += 1;
                    error!(server = %name, error = %e, "server failed to start");
                }
            }
        }

        let started = state.order.len();
        if failed > 0 {
            warn!(started, failed, "some servers failed to start");
        } else {
            info!(started, "all servers started");
        }

        Arc::new(Self {
            state: RwLock::new(state),
            skip_namespace,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// An empty multiplexer (tests and config without servers).
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(MuxState::default()),
            skip_namespace: false,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Concatenated tool catalogue, children in startup order.
    pub fn list_tools(&self) -> Vec<Value> {
        self.concat(|child| &child.tools)
    }

    pub fn list_resources(&self) -> Vec<Value> {
        self.concat(|child| &child.resources)
    }

    pub fn list_prompts(&self) -> Vec<Value> {
        self.concat(|child| &child.prompts)
    }

    fn concat(&self, pick: impl Fn(&ChildHandle) -> &Vec<Value>) -> Vec<Value> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|name| state.children.get(name))
            .flat_map(|child| pick(child).iter().cloned())
            .collect()
    }

    /// Route `tools/call` to the owning child with the original name.
    pub async fn call_tool(
        &self,
        qualified: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MuxError> {
        let (client, original) = self.resolve(qualified, CatalogueKind::Tool)?;
        let mut params = json!({ "name": original });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        Ok(client.request("tools/call", Some(params)).await?)
    }

    /// Route `resources/read` to the owning child with the original URI.
    pub async fn read_resource(&self, qualified: &str) -> Result<Value, MuxError> {
        let (client, original) = self.resolve(qualified, CatalogueKind::Resource)?;
        Ok(client
            .request("resources/read", Some(json!({ "uri": original })))
            .await?)
    }

    /// Route `prompts/get` to the owning child with the original name.
    pub async fn get_prompt(
        &self,
        qualified: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MuxError> {
        let (client, original) = self.resolve(qualified, CatalogueKind::Prompt)?;
        let mut params = json!({ "name": original });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        Ok(client.request("prompts/get", Some(params)).await?)
    }

    /// Route `completion/complete`, discriminating on `ref.type`.
    pub async fn complete(&self, mut params: Value) -> Result<Value, MuxError> {
        let ref_type = params["ref"]["type"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        match ref_type.as_str() {
            "ref/prompt" => {
                let qualified = params["ref"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let (client, original) = self.resolve(&qualified, CatalogueKind::Prompt)?;
                params["ref"]["name"] = Value::String(original);
                Ok(client.request("completion/complete", Some(params)).await?)
            }
            "ref/resource" => {
                let qualified = params["ref"]["uri"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let (client, original) = self.resolve(&qualified, CatalogueKind::Resource)?;
                params["ref"]["uri"] = Value::String(original);
                Ok(client.request("completion/complete", Some(params)).await?)
            }
            other => Err(MuxError::Downstream(format!(
                "unsupported completion reference type: {other}"
            ))),
        }
    }

    /// Look up the owning child and recover the original identifier.
    fn resolve(
        &self,
        qualified: &str,
        kind: CatalogueKind,
    ) -> Result<(Arc<StdioRpcClient>, String), MuxError> {
        let missing = || match kind {
            CatalogueKind::Tool => MuxError::UnknownTool(qualified.to_string()),
            CatalogueKind::Resource => MuxError::UnknownResource(qualified.to_string()),
            CatalogueKind::Prompt => MuxError::UnknownPrompt(qualified.to_string()),
        };

        let state = self.state.read();
        let server = state.index(kind).get(qualified).ok_or_else(missing)?;
        let child = state.children.get(server).ok_or_else(missing)?;
        let original = if self.skip_namespace {
            qualified.to_string()
        } else {
            namespace::strip(server, qualified)
                .unwrap_or(qualified)
                .to_string()
        };
        Ok((Arc::clone(&child.client), original))
    }

    /// Ping every child and report up/down plus catalogue counts.
    pub async fn health(&self) -> Vec<ChildHealth> {
        let children: Vec<Arc<ChildHandle>> = {
            let state = self.state.read();
            state
                .order
                .iter()
                .filter_map(|name| state.children.get(name).cloned())
                .collect()
        };

        let mut report = Vec::with_capacity(children.len());
        for child in children {
            let up = child.client.request("ping", None).await.is_ok();
            report.push(ChildHealth {
                name: child.name.clone(),
                status: if up { "up" } else { "down" },
                tools: child.tools.len(),
                resources: child.resources.len(),
                prompts: child.prompts.len(),
            });
        }
        report
    }

    /// Close every child transport concurrently and clear the indexes.
    ///
    /// A second call while shutdown is in progress logs and force-exits.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            error!("forcing exit");
            std::process::exit(1);
        }

        let state = std::mem::take(&mut *self.state.write());
        let mut join_set = JoinSet::new();
        for child in state.children.into_values() {
            join_set.spawn(async move {
                let name = child.name.clone();
                (name, child.client.shutdown().await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(server = %name, "server stopped"),
                Ok((name, Err(e))) => {
                    warn!(server = %name, error = %e, "server shutdown failed")
                }
                Err(e) => warn!(error = %e, "shutdown task panicked"),
            }
        }
    }

    /// Number of connected children.
    pub fn child_count(&self) -> usize {
        self.state.read().order.len()
    }

    #[cfg(test)]
    fn insert_for_test(&self, handle: ChildHandle) {
        index_child(&mut self.state.write(), handle);
    }
}

/// Add a started child to the state and the routing indexes.
fn index_child(state: &mut MuxState, handle: ChildHandle) {
    let name = handle.name.clone();
    for tool in &handle.tools {
        if let Some(id) = tool.get("name").and_then(Value::as_str) {
            state.tool_index.insert(id.to_string(), name.clone());
        }
    }
    for resource in &handle.resources {
        if let Some(id) = resource.get("uri").and_then(Value::as_str) {
            state.resource_index.insert(id.to_string(), name.clone());
        }
    }
    for prompt in &handle.prompts {
        if let Some(id) = prompt.get("name").and_then(Value::as_str) {
            state.prompt_index.insert(id.to_string(), name.clone());
        }
    }
    state.order.push(name.clone());
    state.children.insert(name, Arc::new(handle));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str, tools: Vec<&str>) -> ChildHandle {
        // `cat` ignores JSON-RPC; these tests only exercise catalogue and
        // index bookkeeping, never a routed call.
        let client = Arc::new(
            StdioRpcClient::spawn(name, "cat", &[], &HashMap::new(), false, true).unwrap(),
        );
        ChildHandle {
            name: name.to_string(),
            client,
            tools: tools
                .iter()
                .map(|t| json!({"name": format!("{name}__{t}")}))
                .collect(),
            resources: vec![],
            prompts: vec![],
        }
    }

    #[tokio::test]
    async fn test_catalogue_concatenation_and_collision_freedom() {
        let mux = Multiplexer::empty();
        mux.insert_for_test(handle("a", vec!["x"]));
        mux.insert_for_test(handle("b", vec!["x"]));

        let tools = mux.list_tools();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a__x", "b__x"]);
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_tool_error_message() {
        let mux = Multiplexer::empty();
        let err = mux.call_tool("ghost__doNothing", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown tool: ghost__doNothing");
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_resource_and_prompt() {
        let mux = Multiplexer::empty();
        let err = mux.read_resource("ghost__file:///x").await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown resource: ghost__file:///x");
        let err = mux.get_prompt("ghost__p", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown prompt: ghost__p");
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_completion_ref_discrimination() {
        let mux = Multiplexer::empty();
        let err = mux
            .complete(json!({"ref": {"type": "ref/prompt", "name": "nope__p"}, "argument": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::UnknownPrompt(_)));
        let err = mux
            .complete(json!({"ref": {"type": "ref/other"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Downstream(_)));
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_catalogue_is_legal() {
        let mux = Multiplexer::empty();
        assert!(mux.list_tools().is_empty());
        assert!(mux.list_resources().is_empty());
        assert!(mux.list_prompts().is_empty());
        assert_eq!(mux.child_count(), 0);
        mux.shutdown().await;
    }
}
