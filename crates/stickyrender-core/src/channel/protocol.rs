//! Command channel message handling

use crate::error::{ChannelError, DispatchError};
use crate::types::{
    error_codes, Action, HelloParams, HelloResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    CHANNEL_PROTOCOL_VERSION, HELLO_METHOD,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Largest line accepted on the channel
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Protocol handler for command channel messages
pub struct ProtocolHandler {
    request_id: AtomicU64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_id: AtomicU64::new(1),
        }
    }

    /// Generate next request ID
    pub fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create the handshake request
    pub fn create_hello_request(&self, token: Option<&str>) -> JsonRpcRequest {
        let params = HelloParams {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            token: token.map(str::to_string),
        };

        JsonRpcRequest::new(self.next_id(), HELLO_METHOD, serde_json::to_value(params).ok())
    }

    /// Create the request carrying an action
    pub fn create_action_request(&self, action: &Action) -> JsonRpcRequest {
        JsonRpcRequest::new(self.next_id(), &action.name, Some(action.args.to_json()))
    }

    /// Parse the handshake response
    pub fn parse_hello_response(&self, response: &JsonRpcResponse) -> Result<HelloResult, ChannelError> {
        if let Some(error) = &response.error {
            return Err(match error.code {
                error_codes::UNAUTHORIZED => ChannelError::Unauthorized(error.message.clone()),
                _ => ChannelError::InvalidMessage(format!("handshake failed: {}", error.message)),
            });
        }

        let result = response
            .result
            .clone()
            .ok_or_else(|| ChannelError::InvalidMessage("No result in hello response".to_string()))?;
        let hello: HelloResult = serde_json::from_value(result)
            .map_err(|e| ChannelError::InvalidMessage(format!("Malformed hello response: {}", e)))?;

        if hello.protocol_version != CHANNEL_PROTOCOL_VERSION {
            warn!(
                "Stub speaks channel protocol v{}, adaptor speaks v{}",
                hello.protocol_version, CHANNEL_PROTOCOL_VERSION
            );
        }
        Ok(hello)
    }

    /// Parse the response to an action into its result value or dispatch error
    pub fn parse_action_response(
        &self,
        action_name: &str,
        response: JsonRpcResponse,
    ) -> Result<serde_json::Value, DispatchError> {
        if let Some(error) = response.error {
            return Err(DispatchError::from_wire(action_name, error.code, &error.message));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    /// Classify a decoded JSON value
    pub fn parse_message(&self, value: &serde_json::Value) -> Result<ChannelMessage, ChannelError> {
        if value.get("id").is_some() && (value.get("result").is_some() || value.get("error").is_some()) {
            let response: JsonRpcResponse = serde_json::from_value(value.clone())
                .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
            return Ok(ChannelMessage::Response(response));
        }

        if value.get("method").is_some() {
            let request: JsonRpcRequest = serde_json::from_value(value.clone())
                .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
            return Ok(ChannelMessage::Request(request));
        }

        Err(ChannelError::InvalidMessage(format!("Unknown message type: {}", value)))
    }

    pub fn create_result_response(&self, request_id: serde_json::Value, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(request_id),
            result: Some(result),
            error: None,
        }
    }

    pub fn create_error_response(&self, request_id: serde_json::Value, code: i32, message: &str) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(request_id),
            result: None,
            error: Some(JsonRpcError::new(code, message)),
        }
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded command channel message
#[derive(Debug)]
pub enum ChannelMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

/// Decode one line into a request, or produce the error response to send back.
///
/// Used by both the stub and the daemon control server.
pub fn decode_request_line(protocol: &ProtocolHandler, line: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
        protocol.create_error_response(serde_json::Value::Null, error_codes::PARSE_ERROR, &e.to_string())
    })?;

    match protocol.parse_message(&value) {
        Ok(ChannelMessage::Request(request)) if request.id.is_some() => Ok(request),
        Ok(_) | Err(_) => {
            let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);
            Err(protocol.create_error_response(id, error_codes::INVALID_REQUEST, "Expected a JSON-RPC request with an id"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionArgs;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_ids_are_monotonic() {
        let protocol = ProtocolHandler::new();
        let a = protocol.create_hello_request(None);
        let b = protocol.create_action_request(&Action::new("ping", ActionArgs::new()));
        assert!(b.seq().unwrap() > a.seq().unwrap());
    }

    #[test]
    fn test_action_request_shape() {
        let protocol = ProtocolHandler::new();
        let action = Action::new("start_render", ActionArgs::new().with("frame", 42));
        let request = protocol.create_action_request(&action);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "start_render");
        assert_eq!(json["params"], json!({"frame": 42}));
        assert_eq!(json["jsonrpc"], "2.0");
    }

    #[test]
    fn test_parse_action_error_response() {
        let protocol = ProtocolHandler::new();
        let response = protocol.create_error_response(json!(3), error_codes::UNKNOWN_COMMAND, "Unknown command: foo");
        let err = protocol.parse_action_response("foo", response).unwrap_err();
        assert_eq!(err, DispatchError::UnknownCommand("foo".to_string()));
    }

    #[test]
    fn test_hello_unauthorized() {
        let protocol = ProtocolHandler::new();
        let response = protocol.create_error_response(json!(1), error_codes::UNAUTHORIZED, "bad token");
        let err = protocol.parse_hello_response(&response).unwrap_err();
        assert_eq!(err, ChannelError::Unauthorized("bad token".to_string()));
    }

    #[test]
    fn test_decode_request_line_errors() {
        let protocol = ProtocolHandler::new();
        let err = decode_request_line(&protocol, "not json").unwrap_err();
        assert_eq!(err.error.unwrap().code, error_codes::PARSE_ERROR);

        let err = decode_request_line(&protocol, r#"{"jsonrpc":"2.0","id":4,"result":1}"#).unwrap_err();
        assert_eq!(err.id, Some(json!(4)));
        assert_eq!(err.error.unwrap().code, error_codes::INVALID_REQUEST);

        let ok = decode_request_line(&protocol, r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#).unwrap();
        assert_eq!(ok.method, "ping");
    }
}
