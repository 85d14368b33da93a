//! Newline-delimited JSON-RPC over an arbitrary byte stream.
//!
//! Used for subprocess stdio and for the in-memory duplex that links the
//! client to an in-process server.

use super::McpTransport;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

const REQUEST_TIMEOUT_SECONDS: u64 = 60;
const WRITE_TIMEOUT_SECONDS: u64 = 10;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

pub struct StreamTransport {
    server_id: String,
    writer: SharedWriter,
    pending: PendingMap,
    next_request_id: AtomicI64,
    request_timeout: Duration,
}

impl StreamTransport {
    /// Wraps a reader/writer pair and starts the background reader task.
    pub fn spawn<R, W>(server_id: &str, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let transport = Arc::new(Self {
            server_id: server_id.to_string(),
            writer: writer.clone(),
            pending: pending.clone(),
            next_request_id: AtomicI64::new(0),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECONDS),
        });

        tokio::spawn(read_loop(
            server_id.to_string(),
            BufReader::new(reader),
            writer,
            pending,
        ));
        transport
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_message(&self, payload: &str) -> Result<(), String> {
        write_line(&self.writer, payload).await
    }
}

#[async_trait]
impl McpTransport for StreamTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| err.to_string())?;
        let payload = serde_json::to_string(&message).map_err(|err| err.to_string())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        debug!(server_id = %self.server_id, request_id = ?request_id, bytes = payload.len(), "Writing MCP stream request");
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err("MCP server closed the connection.".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                debug!(server_id = %self.server_id, request_id = ?request_id, "MCP stream request timed out");
                Err("MCP request timed out.".to_string())
            }
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| err.to_string())?;
        let payload = serde_json::to_string(&message).map_err(|err| err.to_string())?;
        self.write_message(&payload).await
    }

    async fn close(&self) -> Result<(), String> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(|err| err.to_string())
    }
}

async fn write_line(writer: &SharedWriter, payload: &str) -> Result<(), String> {
    let write_timeout = Duration::from_secs(WRITE_TIMEOUT_SECONDS);
    let mut writer = tokio::time::timeout(write_timeout, writer.lock())
        .await
        .map_err(|_| "Timed out waiting for MCP writer lock.".to_string())?;
    tokio::time::timeout(write_timeout, writer.write_all(payload.as_bytes()))
        .await
        .map_err(|_| "Timed out writing MCP message.".to_string())?
        .map_err(|err| err.to_string())?;
    tokio::time::timeout(write_timeout, writer.write_all(b"\n"))
        .await
        .map_err(|_| "Timed out writing MCP message newline.".to_string())?
        .map_err(|err| err.to_string())?;
    tokio::time::timeout(write_timeout, writer.flush())
        .await
        .map_err(|_| "Timed out flushing MCP message.".to_string())?
        .map_err(|err| err.to_string())
}

async fn read_loop<R>(
    server_id: String,
    reader: BufReader<R>,
    writer: SharedWriter,
    pending: PendingMap,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let value = match serde_json::from_str::<Value>(&line) {
            Ok(value) => value,
            Err(_) => {
                debug!(server_id = %server_id, "Skipping non-JSON line from MCP server");
                continue;
            }
        };
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            match serde_json::from_value::<ServerMessage>(item) {
                Ok(message) => dispatch_message(&server_id, message, &writer, &pending).await,
                Err(err) => debug!(server_id = %server_id, error = %err, "Unrecognized MCP message"),
            }
        }
    }

    debug!(server_id = %server_id, "MCP stream closed");
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().await.clear();
}

async fn dispatch_message(
    server_id: &str,
    message: ServerMessage,
    writer: &SharedWriter,
    pending: &PendingMap,
) {
    match &message {
        ServerMessage::Response(response) => {
            if let Some(tx) = pending.lock().await.remove(&response.id) {
                let _ = tx.send(message);
            }
        }
        ServerMessage::Error(error) => {
            if let Some(id) = error.id.as_ref() {
                if let Some(tx) = pending.lock().await.remove(id) {
                    let _ = tx.send(message);
                }
            }
        }
        ServerMessage::Request(request) => {
            let method = request.method().to_string();
            let id = serde_json::to_value(request.request_id()).unwrap_or(Value::Null);
            let reply = server_request_reply(&method, id);
            debug!(server_id = %server_id, method = %method, "Answering MCP server request");
            if let Err(err) = write_line(writer, &reply.to_string()).await {
                warn!(server_id = %server_id, error = %err, "Failed to answer MCP server request");
            }
        }
        ServerMessage::Notification(_) => {
            debug!(server_id = %server_id, "Received MCP notification");
        }
    }
}

/// The client advertises no capabilities, so only `ping` gets a result.
pub(crate) fn server_request_reply(method: &str, id: Value) -> Value {
    if method == "ping" {
        json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": super::MCP_METHOD_NOT_FOUND,
                "message": format!("Method not supported by client: {method}")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn correlates_responses_by_request_id() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);
        let transport = StreamTransport::spawn("echo", client_read, client_write);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).expect("json request");
                let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
                server_write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .expect("write reply");
            }
        });

        let message = transport
            .send_request(RequestFromClient::PingRequest(None))
            .await
            .expect("ping reply");
        assert!(matches!(message, ServerMessage::Response(_)));
    }

    #[tokio::test]
    async fn pending_requests_fail_when_stream_closes() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let transport = StreamTransport::spawn("gone", client_read, client_write);

        let request = tokio::spawn({
            let transport = transport.clone();
            async move {
                transport
                    .send_request(RequestFromClient::PingRequest(None))
                    .await
            }
        });
        tokio::task::yield_now().await;
        drop(server_io);

        let err = request.await.expect("join").expect_err("expected failure");
        assert!(!err.is_empty());
    }

    #[test]
    fn only_ping_is_answered_with_a_result() {
        let ping = server_request_reply("ping", json!(7));
        assert_eq!(ping["result"], json!({}));
        let sampling = server_request_reply("sampling/createMessage", json!(8));
        assert_eq!(
            sampling["error"]["code"],
            json!(crate::mcp::transport::MCP_METHOD_NOT_FOUND)
        );
    }
}
