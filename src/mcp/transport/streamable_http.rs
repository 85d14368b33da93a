//! Streamable HTTP transport: every message is a POST to one endpoint, and
//! the reply body is either plain JSON or a short event stream.

use super::sse_codec::{is_event_stream_content_type, next_sse_server_message};
use super::{
    apply_custom_headers, apply_protocol_version_header, noop_teardown, Connection, McpTransport,
    MCP_JSON_AND_SSE_ACCEPT, MCP_JSON_CONTENT_TYPE, MCP_SESSION_ID_HEADER,
};
use crate::core::config::ServerConfig;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT_SECONDS: u64 = 60;
const CONNECT_TIMEOUT_SECONDS: u64 = 10;

pub struct StreamableHttpTransport {
    server_id: String,
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    next_request_id: AtomicI64,
}

/// Builds the transport. Nothing is sent until the first request, so an
/// unreachable endpoint surfaces during the initialize handshake.
pub fn connect(config: &ServerConfig) -> Result<Connection, String> {
    let transport = StreamableHttpTransport::new(config)?;
    Ok(Connection {
        transport: Arc::new(transport),
        teardown: noop_teardown(),
    })
}

pub(crate) fn require_endpoint(config: &ServerConfig) -> Result<String, String> {
    let endpoint = config
        .endpoint()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| "MCP baseUrl is required for HTTP transports.".to_string())?;
    url::Url::parse(endpoint).map_err(|err| format!("Invalid MCP baseUrl `{endpoint}`: {err}"))?;
    Ok(endpoint.to_string())
}

pub(crate) fn build_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| err.to_string())
}

impl StreamableHttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, String> {
        Ok(Self {
            server_id: config.id.clone(),
            client: build_http_client()?,
            url: require_endpoint(config)?,
            headers: config.headers.clone(),
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            next_request_id: AtomicI64::new(0),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_session_id(&self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session_id.to_string());
        }
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let protocol_version = self.protocol_version();
        let mut request = apply_protocol_version_header(
            apply_custom_headers(self.client.request(method, &self.url), &self.headers),
            protocol_version.as_deref(),
        );
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response, String> {
        let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        let response = self
            .request(reqwest::Method::POST)
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .body(payload)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        self.remember_session_id(&response);
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(request_id)),
        )
        .map_err(|err| err.to_string())?;

        debug!(server_id = %self.server_id, url = %self.url, request_id, "Sending MCP HTTP request");
        let response = self.post(&message).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response).await
        } else {
            let body = response.bytes().await.map_err(|err| err.to_string())?;
            serde_json::from_slice::<ServerMessage>(&body).map_err(|err| err.to_string())
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| err.to_string())?;
        self.post(&message).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), String> {
        if self.session_id().is_none() {
            return Ok(());
        }
        let response = self
            .request(reqwest::Method::DELETE)
            .timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        // Servers may refuse client-initiated session termination.
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            Err(format!("HTTP error closing session: {status}"))
        }
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TransportKind;

    #[test]
    fn endpoint_is_required_and_validated() {
        let mut config = ServerConfig::http("remote", TransportKind::StreamableHttp, "not a url");
        assert!(require_endpoint(&config)
            .expect_err("expected invalid url")
            .contains("Invalid MCP baseUrl"));

        config.base_url = None;
        config.url = None;
        assert!(require_endpoint(&config).is_err());

        config.url = Some("https://mcp.example.com/mcp".to_string());
        assert_eq!(
            require_endpoint(&config).expect("legacy alias accepted"),
            "https://mcp.example.com/mcp"
        );
    }

    #[test]
    fn requests_carry_session_and_protocol_headers() {
        let mut config =
            ServerConfig::http("remote", TransportKind::StreamableHttp, "https://mcp.example.com/mcp");
        config
            .headers
            .insert("Authorization".to_string(), "Bearer abc".to_string());
        let transport = StreamableHttpTransport::new(&config).expect("transport");
        transport.set_protocol_version("2025-06-18");
        *transport.session_id.lock().expect("lock") = Some("session-1".to_string());

        let request = transport
            .request(reqwest::Method::POST)
            .build()
            .expect("request");
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        assert_eq!(header(MCP_SESSION_ID_HEADER).as_deref(), Some("session-1"));
        assert_eq!(
            header(super::super::MCP_PROTOCOL_VERSION_HEADER).as_deref(),
            Some("2025-06-18")
        );
        assert_eq!(header("Authorization").as_deref(), Some("Bearer abc"));
    }
}
