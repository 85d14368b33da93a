use crate::bridge::message::BridgeRequest;
use crate::mcp::error::McpError;
use crate::mcp::ConnectionManager;
use serde::Serialize;
use serde_json::{json, Value};

/// Runs one hub request against the connection manager and returns the
/// JSON payload for the `response` envelope.
pub async fn dispatch(manager: &ConnectionManager, request: BridgeRequest) -> Result<Value, McpError> {
    match request {
        BridgeRequest::ListServers => Ok(json!({ "servers": manager.server_summaries() })),
        BridgeRequest::ListTools(target) => to_payload(&manager.list_tools(&target.server_id).await?),
        BridgeRequest::ListResources(target) => {
            to_payload(&manager.list_resources(&target.server_id).await?)
        }
        BridgeRequest::ListPrompts(target) => {
            to_payload(&manager.list_prompts(&target.server_id).await?)
        }
        BridgeRequest::CallTool(call) => to_payload(
            &manager
                .call_tool(&call.server_id, &call.name, call.arguments)
                .await?,
        ),
        BridgeRequest::ReadResource(read) => {
            to_payload(&manager.read_resource(&read.server_id, &read.uri).await?)
        }
        BridgeRequest::GetPrompt(prompt) => to_payload(
            &manager
                .get_prompt(&prompt.server_id, &prompt.name, prompt.arguments)
                .await?,
        ),
    }
}

fn to_payload<T: Serialize>(result: &T) -> Result<Value, McpError> {
    serde_json::to_value(result).map_err(|err| McpError::Bridge(format!("Failed to encode result: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::message::{ServerTarget, CallToolPayload};
    use crate::core::config::{ConfigStore, ServerConfig};
    use crate::mcp::connector::TransportConnector;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager_with(configs: Vec<ServerConfig>) -> ConnectionManager {
        ConnectionManager::new(
            ConfigStore::in_memory(configs),
            Arc::new(TransportConnector::new(Duration::from_secs(5))),
        )
    }

    #[tokio::test]
    async fn list_servers_exposes_no_secrets() {
        let mut config = ServerConfig::stdio("db", "db-server", vec!["--token".to_string()]);
        config.env.insert("DB_PASSWORD".to_string(), "hunter2".to_string());
        config.name = Some("Database".to_string());
        let manager = manager_with(vec![config]);

        let payload = dispatch(&manager, BridgeRequest::ListServers)
            .await
            .expect("list servers");

        assert_eq!(payload["servers"][0]["id"], "db");
        assert_eq!(payload["servers"][0]["name"], "Database");
        assert_eq!(payload["servers"][0]["transportKind"], "stdio");
        assert_eq!(payload["servers"][0]["connected"], false);
        let text = payload.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("db-server"));
    }

    #[tokio::test]
    async fn unknown_server_is_reported() {
        let manager = manager_with(Vec::new());
        let err = dispatch(
            &manager,
            BridgeRequest::ListTools(ServerTarget {
                server_id: "ghost".to_string(),
            }),
        )
        .await
        .err()
        .expect("expected failure");
        assert_eq!(err, McpError::ConfigNotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn tool_calls_reach_the_builtin_server() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp directory");
        std::fs::write(temp_dir.path().join("notes.txt"), "hello").expect("write fixture");
        let root = temp_dir.path().to_string_lossy().to_string();
        let manager = manager_with(vec![ServerConfig::builtin_filesystem("fs", vec![root.clone()], true)]);

        let mut arguments = serde_json::Map::new();
        arguments.insert("path".to_string(), json!(format!("{root}/notes.txt")));
        let payload = dispatch(
            &manager,
            BridgeRequest::CallTool(CallToolPayload {
                server_id: "fs".to_string(),
                name: "read_file".to_string(),
                arguments: Some(arguments),
            }),
        )
        .await
        .expect("call tool");

        assert_eq!(payload["content"][0]["text"], "hello");
        manager.shutdown().await;
    }
}
