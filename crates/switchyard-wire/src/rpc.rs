//! JSON-RPC 2.0 envelopes carried in `Q` and `S` frames.
//!
//! Ids are informational only: replies are matched to calls by position on
//! the socket, never by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version string written into every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes used on the wire.
pub mod codes {
    /// Request text is not valid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// JSON is valid but not a request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// No peer (or local table) serves the method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Parameters were rejected by the method.
    pub const INVALID_PARAMS: i64 = -32602;
    /// The method failed while executing.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A queued `invoke` was not routed before its deadline.
    pub const ROUTE_TIMEOUT: i64 = -32000;
    /// The session carrying the call closed before a reply arrived.
    pub const PEER_DISCONNECTED: i64 = -32001;
    /// The node was terminated while the call was pending.
    pub const NODE_TERMINATED: i64 = -32002;
}

/// Structured RPC error, both as carried on the wire and as returned to callers.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a `data` member.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {detail}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, detail.to_string())
    }

    pub fn route_timeout(method: &str) -> Self {
        Self::new(
            codes::ROUTE_TIMEOUT,
            format!("No peer supporting '{method}' connected in time"),
        )
    }

    pub fn peer_disconnected() -> Self {
        Self::new(
            codes::PEER_DISCONNECTED,
            "Peer disconnected before replying",
        )
    }

    pub fn node_terminated() -> Self {
        Self::new(codes::NODE_TERMINATED, "Node terminated")
    }

    /// Whether this is a method-not-found error.
    pub fn is_method_not_found(&self) -> bool {
        self.code == codes::METHOD_NOT_FOUND
    }
}

/// Keep an explicit `null` as `Some(Value::Null)`; only a missing field is `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC request. A request without an `id` member is a notification;
/// `"id": null` is still a call and gets a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a call with positional params.
    pub fn call(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params: Some(Value::Array(params)),
        }
    }

    /// Parse a `Q` payload.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(text).map_err(RpcError::parse_error)?;
        let request: RpcRequest =
            serde_json::from_value(value).map_err(RpcError::invalid_request)?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(RpcError::invalid_request(format!(
                "unsupported jsonrpc version '{}'",
                request.jsonrpc
            )));
        }
        Ok(request)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Positional parameters. Absent or `null` params are empty; a by-name
    /// object is passed as a single argument.
    pub fn positional_params(&self) -> Vec<Value> {
        match &self.params {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        }
    }
}

/// JSON-RPC response: exactly one of `result` / `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Build from a method outcome.
    pub fn from_outcome(id: Value, outcome: Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(id, error),
        }
    }

    /// Parse an `S` payload. A malformed reply becomes an internal error
    /// for the waiting caller rather than a transport failure.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        serde_json::from_str(text)
            .map_err(|e| RpcError::internal(format!("Malformed response: {e}")))
    }

    /// Collapse into the caller-facing outcome. A missing or `null` result
    /// reads as `Value::Null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let req = RpcRequest::call(7, "add", vec![json!(1), json!(2)]);
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","id":7,"method":"add","params":[1,2]}"#
        );
        assert_eq!(RpcRequest::parse(&text).unwrap(), req);
    }

    #[test]
    fn test_request_parse_errors() {
        assert_eq!(
            RpcRequest::parse("{nope").unwrap_err().code,
            codes::PARSE_ERROR
        );
        assert_eq!(
            RpcRequest::parse(r#"{"jsonrpc":"2.0","id":1}"#)
                .unwrap_err()
                .code,
            codes::INVALID_REQUEST
        );
        assert_eq!(
            RpcRequest::parse(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#)
                .unwrap_err()
                .code,
            codes::INVALID_REQUEST
        );
    }

    #[test]
    fn test_notification_and_params() {
        let req = RpcRequest::parse(r#"{"jsonrpc":"2.0","method":"log"}"#).unwrap();
        assert!(req.is_notification());
        assert!(req.positional_params().is_empty());

        let req =
            RpcRequest::parse(r#"{"jsonrpc":"2.0","id":"a","method":"m","params":{"k":1}}"#)
                .unwrap();
        assert_eq!(req.positional_params(), vec![json!({"k": 1})]);
    }

    #[test]
    fn test_null_id_is_not_a_notification() {
        let req = RpcRequest::parse(r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#).unwrap();
        assert!(!req.is_notification());
        assert_eq!(req.id, Some(Value::Null));
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#
        );
    }

    #[test]
    fn test_response_outcomes() {
        let ok = RpcResponse::success(json!(1), json!("hi"));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"jsonrpc":"2.0","id":1,"result":"hi"}"#
        );
        assert_eq!(ok.into_result().unwrap(), json!("hi"));

        let null_result = RpcResponse::parse(r#"{"jsonrpc":"2.0","id":2,"result":null}"#).unwrap();
        assert_eq!(null_result.into_result().unwrap(), Value::Null);

        let err = RpcResponse::failure(json!(3), RpcError::method_not_found("ghost"));
        let text = serde_json::to_string(&err).unwrap();
        let back = RpcResponse::parse(&text).unwrap().into_result().unwrap_err();
        assert!(back.is_method_not_found());
        assert_eq!(back.message, "Method not found: ghost");
    }

    #[test]
    fn test_error_display_and_data() {
        let err = RpcError::invalid_params("expected two numbers").with_data(json!([1]));
        assert_eq!(
            err.to_string(),
            "JSON-RPC error -32602: Invalid params: expected two numbers"
        );
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains(r#""data":[1]"#));
    }

    #[test]
    fn test_malformed_response_is_internal() {
        let err = RpcResponse::parse("not json").unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
    }
}
