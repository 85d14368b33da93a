use crate::mcp::transport::format_rpc_error;
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    PaginatedRequestParams, LATEST_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub(crate) fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Toolbridge".to_string()),
            description: Some("Local MCP connection manager and hub bridge".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub(crate) fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

pub(crate) fn parse_response<T: DeserializeOwned>(message: ServerMessage) -> Result<T, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| err.to_string())
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format!("Unexpected MCP server message: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_initialize_rejects_blank_protocol_version() {
        let message = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "capabilities": {},
                "protocolVersion": " ",
                "serverInfo": {"name": "x", "version": "1.0.0"}
            }
        }))
        .expect("message should parse");

        assert!(parse_initialize_result(message).is_err());
    }

    #[test]
    fn rpc_errors_become_messages() {
        let message = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32602, "message": "Invalid params", "data": "missing name"}
        }))
        .expect("message should parse");

        let err = parse_response_value(message).expect_err("expected error");
        assert!(err.starts_with("MCP error -32602: Invalid params"));
        assert!(err.ends_with("missing name"));
    }
}
