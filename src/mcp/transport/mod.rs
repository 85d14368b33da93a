//! Shared MCP transport abstractions.
//!
//! Implementations normalize protocol differences across in-process, stdio,
//! streamable HTTP and legacy SSE servers so the client and manager only see
//! request/response pairs.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use rust_mcp_schema::RpcError;

pub mod sse;
pub mod sse_codec;
pub mod stdio;
pub mod stream;
pub mod streamable_http;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_EVENT_STREAM_ACCEPT: &str = "text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

#[async_trait]
/// Transport contract required by the MCP client.
pub trait McpTransport: Send + Sync {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String>;

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String>;

    /// Protocol-level close (e.g. ending an HTTP session). Resources owned by
    /// the connection itself are released by its [`Teardown`].
    async fn close(&self) -> Result<(), String>;

    /// Records the protocol version agreed during the handshake.
    fn set_protocol_version(&self, _version: &str) {}
}

/// Releases whatever a connection allocated: a child process, a reader task,
/// an in-process server task.
pub type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

pub fn noop_teardown() -> Teardown {
    Box::new(|| Box::pin(async { Ok(()) }))
}

/// A freshly opened transport plus the cleanup that undoes it.
pub struct Connection {
    pub transport: std::sync::Arc<dyn McpTransport>,
    pub teardown: Teardown,
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

pub fn apply_custom_headers(
    mut request: reqwest::RequestBuilder,
    headers: &std::collections::BTreeMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

pub fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}
