use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod mcp;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "jsonrpc")]
pub enum JsonRpcMessage {
    #[serde(rename = "2.0")]
    V2(JsonRpcV2Message),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcV2Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: JsonRpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl JsonRpcMessage {
    pub fn request(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::V2(JsonRpcV2Message::Request(JsonRpcRequest {
            id,
            method: method.into(),
            params,
        }))
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::V2(JsonRpcV2Message::Notification(JsonRpcNotification {
            method: method.into(),
            params,
        }))
    }

    pub fn success(id: JsonRpcId, result: Value) -> Self {
        JsonRpcMessage::V2(JsonRpcV2Message::Response(JsonRpcResponse {
            id,
            result: Some(result),
            error: None,
        }))
    }

    pub fn failure(id: JsonRpcId, error: JsonRpcError) -> Self {
        JsonRpcMessage::V2(JsonRpcV2Message::Response(JsonRpcResponse {
            id,
            result: None,
            error: Some(error),
        }))
    }

    /// Serializes the message as a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<bytes::Bytes> {
        let mut data = serde_json::to_vec(self)?;
        data.push(b'\n');
        Ok(bytes::Bytes::from(data))
    }

    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
