use super::*;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;

/// Answers requests from canned JSON, recording what was asked.
struct ScriptedTransport {
    calls: Mutex<Vec<String>>,
    notifications: Mutex<usize>,
    protocol_version: Mutex<Option<String>>,
    capabilities: Value,
    tools_supported: bool,
}

impl ScriptedTransport {
    fn new(capabilities: Value) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(0),
            protocol_version: Mutex::new(None),
            capabilities,
            tools_supported: true,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

fn reply(result: Value) -> ServerMessage {
    serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
        .expect("response should parse")
}

fn rpc_error(code: i64, message: &str) -> ServerMessage {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
    .expect("error should parse")
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let message = match request {
            RequestFromClient::InitializeRequest(_) => {
                self.calls.lock().expect("calls lock").push("initialize".into());
                reply(json!({
                    "capabilities": self.capabilities,
                    "protocolVersion": "2025-06-18",
                    "serverInfo": {"name": "scripted", "version": "1.4.2"}
                }))
            }
            RequestFromClient::ListToolsRequest(params) => {
                let cursor = params.and_then(|params| params.cursor);
                self.calls
                    .lock()
                    .expect("calls lock")
                    .push(format!("tools/list {}", cursor.as_deref().unwrap_or("-")));
                if !self.tools_supported {
                    rpc_error(-32601, "Method not found")
                } else if cursor.is_none() {
                    reply(json!({
                        "tools": [{"name": "alpha", "inputSchema": {"type": "object"}}],
                        "nextCursor": "page-2"
                    }))
                } else {
                    reply(json!({
                        "tools": [{"name": "beta", "inputSchema": {"type": "object"}}]
                    }))
                }
            }
            RequestFromClient::CallToolRequest(params) => {
                self.calls
                    .lock()
                    .expect("calls lock")
                    .push(format!("tools/call {}", params.name));
                if params.name == "explode" {
                    rpc_error(-32603, "tool crashed")
                } else {
                    reply(json!({
                        "content": [{"type": "text", "text": "nope"}],
                        "isError": true
                    }))
                }
            }
            RequestFromClient::PingRequest(_) => {
                self.calls.lock().expect("calls lock").push("ping".into());
                reply(json!({}))
            }
            _ => return Err("unexpected request".to_string()),
        };
        Ok(message)
    }

    async fn send_notification(&self, _notification: NotificationFromClient) -> Result<(), String> {
        *self.notifications.lock().expect("notifications lock") += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), String> {
        Ok(())
    }

    fn set_protocol_version(&self, version: &str) {
        *self.protocol_version.lock().expect("version lock") = Some(version.to_string());
    }
}

#[tokio::test]
async fn initialize_records_details_and_sends_initialized() {
    let transport = Arc::new(ScriptedTransport::new(json!({"tools": {}})));
    let client = McpClient::new("scripted", transport.clone());

    client.initialize().await.expect("initialize");

    assert_eq!(client.server_version().as_deref(), Some("1.4.2"));
    assert_eq!(*transport.notifications.lock().expect("lock"), 1);
    assert_eq!(
        transport.protocol_version.lock().expect("lock").as_deref(),
        Some("2025-06-18")
    );
}

#[tokio::test]
async fn tool_listing_follows_cursors() {
    let transport = Arc::new(ScriptedTransport::new(json!({"tools": {}})));
    let client = McpClient::new("scripted", transport.clone());
    client.initialize().await.expect("initialize");

    let tools = client.list_tools().await.expect("list tools");
    let names: Vec<_> = tools.tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(tools.next_cursor.is_none());
    assert_eq!(
        transport.calls(),
        vec!["initialize", "tools/list -", "tools/list page-2"]
    );
}

#[tokio::test]
async fn method_not_found_yields_empty_listing() {
    let mut scripted = ScriptedTransport::new(json!({"tools": {}}));
    scripted.tools_supported = false;
    let client = McpClient::new("scripted", Arc::new(scripted));

    let tools = client.list_tools().await.expect("soft failure");
    assert!(tools.tools.is_empty());
}

#[tokio::test]
async fn listing_skipped_when_capability_missing() {
    let transport = Arc::new(ScriptedTransport::new(json!({})));
    let client = McpClient::new("scripted", transport.clone());
    client.initialize().await.expect("initialize");

    assert!(client.list_tools().await.expect("list").tools.is_empty());
    assert_eq!(transport.calls(), vec!["initialize"]);
}

#[tokio::test]
async fn tool_reported_errors_are_results_but_rpc_errors_fail() {
    let client = McpClient::new(
        "scripted",
        Arc::new(ScriptedTransport::new(json!({"tools": {}}))),
    );

    let result = client.call_tool("soft", None).await.expect("tool result");
    assert_eq!(result.is_error, Some(true));

    let err = client
        .call_tool("explode", None)
        .await
        .expect_err("rpc error");
    assert!(matches!(err, McpError::ToolInvocation(message) if message.contains("tool crashed")));
}

#[tokio::test]
async fn liveness_check_makes_a_single_round_trip() {
    let transport = Arc::new(ScriptedTransport::new(json!({"tools": {}})));
    let client = McpClient::new("scripted", transport.clone());
    client.initialize().await.expect("initialize");

    client.check_alive().await.expect("alive");
    assert_eq!(transport.calls(), vec!["initialize", "tools/list -"]);
}

#[tokio::test]
async fn liveness_check_pings_servers_without_tools() {
    let transport = Arc::new(ScriptedTransport::new(json!({"prompts": {}})));
    let client = McpClient::new("scripted", transport.clone());
    client.initialize().await.expect("initialize");

    client.check_alive().await.expect("alive");
    assert_eq!(transport.calls(), vec!["initialize", "ping"]);
}
