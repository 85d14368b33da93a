//! Protocol client bound to one live transport.

pub(crate) mod protocol;
#[cfg(test)]
mod tests;

use crate::mcp::error::McpError;
use crate::mcp::transport::{format_rpc_error, is_method_not_found, McpTransport};
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    ReadResourceRequestParams, ReadResourceResult, ServerCapabilities,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Upper bound on followed `nextCursor` links per listing.
const MAX_LIST_PAGES: usize = 32;

pub struct McpClient {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    server_details: RwLock<Option<InitializeResult>>,
}

impl McpClient {
    pub fn new(server_id: &str, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            server_id: server_id.to_string(),
            transport,
            server_details: RwLock::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Runs the initialize handshake and announces `initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult, String> {
        let response = self
            .transport
            .send_request(RequestFromClient::InitializeRequest(
                protocol::client_details(),
            ))
            .await?;
        let details = protocol::parse_initialize_result(response)?;
        self.transport
            .set_protocol_version(details.protocol_version.as_str());
        self.transport
            .send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;

        debug!(
            server_id = %self.server_id,
            server = %details.server_info.name,
            protocol_version = %details.protocol_version,
            "MCP handshake complete"
        );
        *self
            .server_details
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(details.clone());
        Ok(details)
    }

    pub fn server_details(&self) -> Option<InitializeResult> {
        self.server_details
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Version string the server reported during the handshake.
    pub fn server_version(&self) -> Option<String> {
        self.server_details()
            .map(|details| details.server_info.version)
            .filter(|version| !version.trim().is_empty())
    }

    fn capabilities(&self) -> Option<ServerCapabilities> {
        self.server_details().map(|details| details.capabilities)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        let response = self.request(RequestFromClient::PingRequest(None)).await?;
        protocol::parse_response_value(response)
            .map(|_| ())
            .map_err(McpError::Request)
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
        if self.capabilities().is_some_and(|caps| caps.tools.is_none()) {
            return Ok(empty_list_tools());
        }
        let mut result = empty_list_tools();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let Some(page) = self.list_tools_page(cursor).await? else {
                break;
            };
            result.tools.extend(page.tools);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(result)
    }

    /// One round-trip liveness check: the first tools page, or `ping` when
    /// the server advertises no tools.
    pub async fn check_alive(&self) -> Result<(), McpError> {
        if self.capabilities().is_some_and(|caps| caps.tools.is_none()) {
            return self.ping().await;
        }
        self.list_tools_page(None).await.map(|_| ())
    }

    async fn list_tools_page(
        &self,
        cursor: Option<String>,
    ) -> Result<Option<ListToolsResult>, McpError> {
        let request = RequestFromClient::ListToolsRequest(protocol::paginated_params(cursor));
        self.list_page::<ListToolsResult>(request).await
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        if self
            .capabilities()
            .is_some_and(|caps| caps.resources.is_none())
        {
            return Ok(empty_list_resources());
        }
        let mut result = empty_list_resources();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let request =
                RequestFromClient::ListResourcesRequest(protocol::paginated_params(cursor));
            let Some(page) = self.list_page::<ListResourcesResult>(request).await? else {
                break;
            };
            result.resources.extend(page.resources);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(result)
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        if self.capabilities().is_some_and(|caps| caps.prompts.is_none()) {
            return Ok(empty_list_prompts());
        }
        let mut result = empty_list_prompts();
        let mut cursor = None;
        for _ in 0..MAX_LIST_PAGES {
            let request = RequestFromClient::ListPromptsRequest(protocol::paginated_params(cursor));
            let Some(page) = self.list_page::<ListPromptsResult>(request).await? else {
                break;
            };
            result.prompts.extend(page.prompts);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(result)
    }

    /// Invokes a tool. A result flagged `isError` is still `Ok`: the tool ran
    /// and reported its own failure. Protocol-level rejections are errors.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = self
            .request(RequestFromClient::CallToolRequest(params))
            .await?;
        if let ServerMessage::Error(error) = &response {
            return Err(McpError::ToolInvocation(format_rpc_error(&error.error)));
        }
        protocol::parse_response(response).map_err(McpError::ToolInvocation)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let response = self
            .request(RequestFromClient::ReadResourceRequest(params))
            .await?;
        protocol::parse_response(response).map_err(McpError::Request)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
            meta: None,
        };
        let response = self
            .request(RequestFromClient::GetPromptRequest(params))
            .await?;
        protocol::parse_response(response).map_err(McpError::Request)
    }

    pub async fn close(&self) -> Result<(), String> {
        self.transport.close().await
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        self.transport
            .send_request(request)
            .await
            .map_err(McpError::Request)
    }

    /// `None` when the server does not implement the listing at all.
    async fn list_page<T: DeserializeOwned>(
        &self,
        request: RequestFromClient,
    ) -> Result<Option<T>, McpError> {
        let response = self.request(request).await?;
        if is_method_not_found(&response) {
            debug!(server_id = %self.server_id, "MCP server does not support listing");
            return Ok(None);
        }
        protocol::parse_response(response)
            .map(Some)
            .map_err(McpError::Request)
    }
}

fn empty_list_tools() -> ListToolsResult {
    ListToolsResult {
        meta: None,
        next_cursor: None,
        tools: Vec::new(),
    }
}

fn empty_list_resources() -> ListResourcesResult {
    ListResourcesResult {
        meta: None,
        next_cursor: None,
        resources: Vec::new(),
    }
}

fn empty_list_prompts() -> ListPromptsResult {
    ListPromptsResult {
        meta: None,
        next_cursor: None,
        prompts: Vec::new(),
    }
}
