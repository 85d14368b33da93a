//! Legacy HTTP+SSE transport.
//!
//! The client holds one GET event stream open. The server first announces a
//! message endpoint with an `endpoint` event; requests are POSTed there and
//! their responses come back over the event stream.

use super::sse_codec::{decode_server_message, is_event_stream_content_type, SseDecoder, SseEvent};
use super::stream::server_request_reply;
use super::streamable_http::{build_http_client, require_endpoint};
use super::{
    apply_custom_headers, Connection, McpTransport, MCP_EVENT_STREAM_ACCEPT,
    MCP_JSON_CONTENT_TYPE,
};
use crate::core::config::ServerConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use url::Url;

const ENDPOINT_TIMEOUT_SECONDS: u64 = 10;
const REQUEST_TIMEOUT_SECONDS: u64 = 60;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct SseTransport {
    server_id: String,
    client: reqwest::Client,
    post_url: Url,
    headers: BTreeMap<String, String>,
    pending: PendingMap,
    next_request_id: AtomicI64,
}

pub async fn connect(config: &ServerConfig) -> Result<Connection, String> {
    let stream_url = Url::parse(&require_endpoint(config)?).map_err(|err| err.to_string())?;
    let client = build_http_client()?;

    debug!(server_id = %config.id, url = %stream_url, "Opening MCP SSE stream");
    let response = apply_custom_headers(client.get(stream_url.clone()), &config.headers)
        .header("Accept", MCP_EVENT_STREAM_ACCEPT)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_event_stream_content_type(content_type) {
        return Err(format!("Expected an event stream, got `{content_type}`."));
    }

    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (endpoint_tx, endpoint_rx) = oneshot::channel();
    let reader = tokio::spawn(read_events(EventReader {
        server_id: config.id.clone(),
        client: client.clone(),
        headers: config.headers.clone(),
        stream_url,
        pending: pending.clone(),
        endpoint_tx: Some(endpoint_tx),
        post_url: None,
    }, response));

    let post_url = match tokio::time::timeout(
        Duration::from_secs(ENDPOINT_TIMEOUT_SECONDS),
        endpoint_rx,
    )
    .await
    {
        Ok(Ok(url)) => url,
        Ok(Err(_)) => {
            reader.abort();
            return Err("SSE stream closed before announcing an endpoint.".to_string());
        }
        Err(_) => {
            reader.abort();
            return Err("Timed out waiting for SSE endpoint.".to_string());
        }
    };
    debug!(server_id = %config.id, endpoint = %post_url, "MCP SSE endpoint announced");

    let transport = SseTransport {
        server_id: config.id.clone(),
        client,
        post_url,
        headers: config.headers.clone(),
        pending,
        next_request_id: AtomicI64::new(0),
    };
    Ok(Connection {
        transport: Arc::new(transport),
        teardown: Box::new(move || {
            Box::pin(async move {
                reader.abort();
                Ok(())
            })
        }),
    })
}

impl SseTransport {
    async fn post(&self, message: &ClientMessage) -> Result<(), String> {
        let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        post_payload(&self.client, &self.post_url, &self.headers, payload).await
    }
}

async fn post_payload(
    client: &reqwest::Client,
    url: &Url,
    headers: &BTreeMap<String, String>,
    payload: String,
) -> Result<(), String> {
    let response = apply_custom_headers(client.post(url.clone()), headers)
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
        .body(payload)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP error: {}", response.status()))
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| err.to_string())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        debug!(server_id = %self.server_id, request_id = ?request_id, "Posting MCP SSE request");
        if let Err(err) = self.post(&message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS), rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err("MCP SSE stream closed.".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
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
        self.post(&message).await
    }

    async fn close(&self) -> Result<(), String> {
        self.pending.lock().await.clear();
        Ok(())
    }
}

struct EventReader {
    server_id: String,
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
    stream_url: Url,
    pending: PendingMap,
    endpoint_tx: Option<oneshot::Sender<Url>>,
    post_url: Option<Url>,
}

async fn read_events(mut reader: EventReader, response: reqwest::Response) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(server_id = %reader.server_id, error = %err, "MCP SSE stream failed");
                break;
            }
        };
        for event in decoder.push(&chunk) {
            reader.handle_event(event).await;
        }
    }
    if let Some(event) = decoder.finish() {
        reader.handle_event(event).await;
    }

    debug!(server_id = %reader.server_id, "MCP SSE stream ended");
    reader.pending.lock().await.clear();
}

impl EventReader {
    async fn handle_event(&mut self, event: SseEvent) {
        if event.event.as_deref() == Some("endpoint") {
            match resolve_endpoint(&self.stream_url, &event.data) {
                Ok(url) => {
                    self.post_url = Some(url.clone());
                    if let Some(tx) = self.endpoint_tx.take() {
                        let _ = tx.send(url);
                    }
                }
                Err(err) => {
                    warn!(server_id = %self.server_id, error = %err, "Ignoring invalid SSE endpoint")
                }
            }
            return;
        }
        if !event.is_message() {
            return;
        }

        let message = match decode_server_message(&event.data) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(err) => {
                debug!(server_id = %self.server_id, error = %err, "Unrecognized MCP SSE message");
                return;
            }
        };

        match &message {
            ServerMessage::Response(response) => {
                if let Some(tx) = self.pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = self.pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                let Some(post_url) = self.post_url.clone() else {
                    return;
                };
                let id = serde_json::to_value(request.request_id()).unwrap_or_default();
                let method = request.method().to_string();
                let reply = server_request_reply(&method, id).to_string();
                let client = self.client.clone();
                let headers = self.headers.clone();
                let server_id = self.server_id.clone();
                // Replying inline would stall the event stream behind a POST.
                tokio::spawn(async move {
                    if let Err(err) = post_payload(&client, &post_url, &headers, reply).await {
                        warn!(server_id = %server_id, error = %err, "Failed to answer MCP server request");
                    }
                });
            }
            ServerMessage::Notification(_) => {}
        }
    }
}

/// Endpoint events carry a path relative to the stream URL, or an absolute
/// URL on the same server.
fn resolve_endpoint(stream_url: &Url, data: &str) -> Result<Url, String> {
    stream_url
        .join(data.trim())
        .map_err(|err| format!("Invalid SSE endpoint `{}`: {err}", data.trim()))
}
