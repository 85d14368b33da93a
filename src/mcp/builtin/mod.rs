//! In-process MCP servers.
//!
//! A builtin server runs as a task on the far side of an in-memory duplex
//! and speaks the same newline-delimited JSON-RPC as a stdio subprocess, so
//! the client cannot tell the two apart.

pub mod filesystem;

use crate::core::config::{BuiltinKind, ServerConfig};
use crate::mcp::transport::stream::StreamTransport;
use crate::mcp::transport::Connection;
use async_trait::async_trait;
use rust_mcp_schema::{RpcError, LATEST_PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;

#[async_trait]
pub trait BuiltinServer: Send + Sync {
    fn name(&self) -> &str;

    fn tools(&self) -> Vec<Value>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError>;

    fn resources(&self) -> Vec<Value>;

    async fn read_resource(&self, uri: &str) -> Result<Value, RpcError>;
}

pub fn server_for(config: &ServerConfig) -> Result<Arc<dyn BuiltinServer>, String> {
    match config.builtin_type.unwrap_or(BuiltinKind::Filesystem) {
        BuiltinKind::Filesystem => Ok(Arc::new(filesystem::FilesystemServer::new(
            &config.allowed_paths,
            config.read_only,
        )?)),
    }
}

/// Starts the configured builtin server and links a client transport to it.
pub fn connect(config: &ServerConfig) -> Result<Connection, String> {
    let server = server_for(config)?;
    let (client_io, server_io) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    debug!(server_id = %config.id, server = %server.name(), "Starting builtin MCP server");
    let task = tokio::spawn(serve(server, server_read, server_write));
    let transport = StreamTransport::spawn(&config.id, client_read, client_write);

    Ok(Connection {
        transport,
        teardown: Box::new(move || {
            Box::pin(async move {
                task.abort();
                Ok(())
            })
        }),
    })
}

/// Answers JSON-RPC requests until the client side of the stream closes.
pub async fn serve<R, W>(server: Arc<dyn BuiltinServer>, reader: R, mut writer: W)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message = match serde_json::from_str::<Value>(&line) {
            Ok(message) => message,
            Err(err) => {
                debug!(server = %server.name(), error = %err, "Builtin server received invalid JSON");
                continue;
            }
        };
        let (Some(id), Some(method)) = (
            message.get("id").cloned(),
            message.get("method").and_then(Value::as_str),
        ) else {
            // Notifications and replies to server requests need no answer.
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let reply = match handle_request(server.as_ref(), method, params).await {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        };
        let mut payload = reply.to_string();
        payload.push('\n');
        if let Err(err) = writer.write_all(payload.as_bytes()).await {
            warn!(server = %server.name(), error = %err, "Builtin server could not write reply");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    debug!(server = %server.name(), "Builtin server stopped");
}

async fn handle_request(
    server: &dyn BuiltinServer,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(LATEST_PROTOCOL_VERSION),
            "capabilities": {"tools": {}, "resources": {}},
            "serverInfo": {"name": server.name(), "version": env!("CARGO_PKG_VERSION")}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": server.tools()})),
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params().with_message("Missing tool name."))?;
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            server.call_tool(name, arguments).await
        }
        "resources/list" => Ok(json!({"resources": server.resources()})),
        "resources/read" => {
            let uri = params
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params().with_message("Missing resource uri."))?;
            server.read_resource(uri).await
        }
        other => Err(RpcError::method_not_found().with_message(&format!("Method not found: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(id: i64, method: &str, params: Value) -> String {
        format!(
            "{}\n",
            json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
        )
    }

    #[tokio::test]
    async fn serve_loop_answers_requests_and_skips_notifications() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_string_lossy().to_string();
        let server: Arc<dyn BuiltinServer> = Arc::new(
            filesystem::FilesystemServer::new(&[root], true).expect("server"),
        );

        let (client_io, server_io) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (server_read, server_write) = tokio::io::split(server_io);
        tokio::spawn(serve(server, server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut replies = BufReader::new(client_read).lines();
        let mut input = String::new();
        input.push_str(&request(1, "initialize", json!({"protocolVersion": "2025-06-18"})));
        input.push_str("{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n");
        input.push_str(&request(2, "prompts/list", json!({})));
        client_write
            .write_all(input.as_bytes())
            .await
            .expect("write requests");

        let init: Value =
            serde_json::from_str(&replies.next_line().await.expect("read").expect("line"))
                .expect("json");
        assert_eq!(init["id"], 1);
        assert_eq!(init["result"]["protocolVersion"], "2025-06-18");

        let unknown: Value =
            serde_json::from_str(&replies.next_line().await.expect("read").expect("line"))
                .expect("json");
        assert_eq!(unknown["id"], 2);
        assert_eq!(
            unknown["error"]["code"],
            json!(crate::mcp::transport::MCP_METHOD_NOT_FOUND)
        );
    }
}
