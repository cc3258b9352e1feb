//! End-to-end multiplexer tests against a scripted child process.
//!
//! The child is a small `sh` script that answers the startup sequence
//! (initialize, tools/list, resources/list, prompts/list) and one routed
//! tool call with canned line-delimited JSON-RPC. Request ids are assigned
//! sequentially by the client, so the canned responses line up.

use std::collections::HashMap;

use mcpbox_core::config::McpServerConfig;
use mcpbox_gateway::Multiplexer;
use serde_json::json;

const MOCK_SERVER: &str = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-11-25","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.0.1"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo"},{"name":"add"},{"name":"fail"}]}}'
read line
echo '{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"resources not supported"}}'
read line
echo '{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"prompts not supported"}}'
while read line; do
  case "$line" in
    *'"method":"ping"'*)
      id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
      echo '{"jsonrpc":"2.0","id":'"$id"',"result":{}}'
      ;;
    *'"fail"'*)
      id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
      echo '{"jsonrpc":"2.0","id":'"$id"',"error":{"code":-32000,"message":"tool exploded"}}'
      ;;
    *)
      id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
      echo '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"8"}]}}'
      ;;
  esac
done
"#;

fn mock_config(tools: Option<Vec<String>>) -> HashMap<String, McpServerConfig> {
    let mut servers = HashMap::new();
    servers.insert(
        "mock".to_string(),
        McpServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), MOCK_SERVER.to_string()],
            env: HashMap::new(),
            tools,
        },
    );
    servers
}

#[tokio::test]
async fn test_catalogue_discovery_and_namespacing() {
    let mux = Multiplexer::start(&mock_config(None), false, true).await;
    assert_eq!(mux.child_count(), 1);

    let tools = mux.list_tools();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["mock__echo", "mock__add", "mock__fail"]);

    // Optional capabilities may be missing without failing the child.
    assert!(mux.list_resources().is_empty());
    assert!(mux.list_prompts().is_empty());

    mux.shutdown().await;
}

#[tokio::test]
async fn test_tool_call_routed_with_original_name() {
    let mux = Multiplexer::start(&mock_config(None), false, true).await;

    let result = mux
        .call_tool("mock__add", Some(json!({"a": 5, "b": 3})))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["type"], "text");
    assert_eq!(result["content"][0]["text"], "8");

    mux.shutdown().await;
}

#[tokio::test]
async fn test_downstream_error_carries_child_message() {
    let mux = Multiplexer::start(&mock_config(None), false, true).await;

    let err = mux.call_tool("mock__fail", None).await.unwrap_err();
    assert_eq!(err.to_string(), "tool exploded");

    mux.shutdown().await;
}

#[tokio::test]
async fn test_allowlist_limits_catalogue() {
    let allow = Some(vec!["echo".to_string(), "add".to_string()]);
    let mux = Multiplexer::start(&mock_config(allow), false, true).await;

    let tools = mux.list_tools();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["mock__echo", "mock__add"]);

    // Filtered-out tools are unroutable.
    let err = mux.call_tool("mock__fail", None).await.unwrap_err();
    assert_eq!(err.to_string(), "Unknown tool: mock__fail");

    mux.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_live_child() {
    let mux = Multiplexer::start(&mock_config(None), false, true).await;

    let report = mux.health().await;
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].name, "mock");
    assert_eq!(report[0].status, "up");
    assert_eq!(report[0].tools, 3);

    mux.shutdown().await;
}

#[tokio::test]
async fn test_failed_child_is_skipped() {
    let mut servers = mock_config(None);
    servers.insert(
        "broken".to_string(),
        McpServerConfig {
            command: "definitely-not-a-real-binary-mcpbox".to_string(),
            args: vec![],
            env: HashMap::new(),
            tools: None,
        },
    );

    let mux = Multiplexer::start(&servers, false, true).await;
    // The broken child is absent; the healthy one still serves.
    assert_eq!(mux.child_count(), 1);
    assert!(mux
        .list_tools()
        .iter()
        .all(|t| t["name"].as_str().unwrap().starts_with("mock__")));

    mux.shutdown().await;
}
