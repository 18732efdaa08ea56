//! Purpose: JSON-RPC 2.0 envelope model plus frame decode/encode for the MCP channel.
//! Exports: `JsonRpcId`, `JsonRpcRequest`, `JsonRpcResponse`, `JsonRpcError`, `Frame`,
//!          `Malformed`, `decode_frame`, `encode_line`, error-code constants.
//! Role: Pure codec; knows nothing about handshake, tools, or caching.
//! Invariants: A frame is a request iff it carries an `id`; otherwise it is a notification.
//! Invariants: Ids are echoed verbatim (strings and numbers round-trip unchanged).
//! Invariants: Encoded replies are a single compact JSON line ending in `\n`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};

pub const JSON_RPC_VERSION: &str = "2.0";
pub const PARSE_ERROR_CODE: i32 = -32700;
pub const INVALID_REQUEST_CODE: i32 = -32600;
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;
pub const INVALID_PARAMS_CODE: i32 = -32602;
pub const INTERNAL_ERROR_CODE: i32 = -32603;
pub const NOT_INITIALIZED_CODE: i32 = -32002;
pub const TOOL_FAILURE_CODE: i32 = -32000;
pub const RESOURCE_NOT_FOUND_CODE: i32 = -32001;
pub const PERMISSION_DENIED_CODE: i32 = -32003;
pub const TIMEOUT_CODE: i32 = -32004;
pub const RESOURCE_EXHAUSTED_CODE: i32 = -32005;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(serde_json::Number),
    Null,
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::String(value) => write!(f, "{value:?}"),
            JsonRpcId::Number(value) => write!(f, "{value}"),
            JsonRpcId::Null => f.write_str("null"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR_CODE, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST_CODE, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND_CODE, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS_CODE, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR_CODE, message)
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(NOT_INITIALIZED_CODE, message)
    }
}

/// A frame that could not be turned into a request or notification.
///
/// `id` is present only when the peer is known to expect a reply; without it
/// the frame is dropped after a diagnostic.
#[derive(Clone, Debug, PartialEq)]
pub struct Malformed {
    pub id: Option<JsonRpcId>,
    pub error: JsonRpcError,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Request(JsonRpcRequest),
    Notification(JsonRpcRequest),
    Malformed(Malformed),
}

pub fn decode_frame(line: &str) -> Frame {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(err) => {
            return Frame::Malformed(Malformed {
                id: sniff_id(line),
                error: JsonRpcError::parse_error(format!("invalid JSON: {err}")),
            });
        }
    };

    let mut object = match value {
        Value::Object(object) => object,
        _ => {
            return Frame::Malformed(Malformed {
                id: None,
                error: JsonRpcError::invalid_request("request must be a JSON object"),
            });
        }
    };

    let id = match object.remove("id") {
        None => None,
        Some(raw) => match parse_jsonrpc_id(raw) {
            Ok(id) => Some(id),
            Err(error) => {
                return Frame::Malformed(Malformed {
                    id: Some(JsonRpcId::Null),
                    error,
                });
            }
        },
    };

    // Replies from the peer have nobody to answer to.
    let is_response = !object.contains_key("method")
        && (object.contains_key("result") || object.contains_key("error"));
    let reply_id = if is_response { None } else { id.clone() };

    match parse_envelope(object, id) {
        Ok(request) if request.is_notification() => Frame::Notification(request),
        Ok(request) => Frame::Request(request),
        Err(error) => Frame::Malformed(Malformed {
            id: reply_id,
            error,
        }),
    }
}

fn parse_envelope(
    mut object: Map<String, Value>,
    id: Option<JsonRpcId>,
) -> Result<JsonRpcRequest, JsonRpcError> {
    let jsonrpc = object
        .remove("jsonrpc")
        .and_then(|value| value.as_str().map(ToString::to_string))
        .ok_or_else(|| JsonRpcError::invalid_request("missing jsonrpc field"))?;
    if jsonrpc != JSON_RPC_VERSION {
        return Err(JsonRpcError::invalid_request("jsonrpc must be \"2.0\""));
    }

    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        Some(_) => return Err(JsonRpcError::invalid_request("method must be a string")),
        None if object.contains_key("result") || object.contains_key("error") => {
            return Err(JsonRpcError::invalid_request(
                "server does not issue requests; unexpected response frame",
            ));
        }
        None => return Err(JsonRpcError::invalid_request("missing method field")),
    };

    Ok(JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params: object.remove("params"),
    })
}

fn parse_jsonrpc_id(value: Value) -> Result<JsonRpcId, JsonRpcError> {
    match value {
        Value::String(value) => Ok(JsonRpcId::String(value)),
        Value::Number(value) => Ok(JsonRpcId::Number(value)),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(JsonRpcError::invalid_request(
            "id must be a string, number, or null",
        )),
    }
}

/// A frame whose bytes were not UTF-8; `lossy` is its replacement-decoded text.
pub fn decode_invalid_utf8(lossy: &str) -> Frame {
    Frame::Malformed(Malformed {
        id: sniff_id(lossy),
        error: JsonRpcError::parse_error("frame is not valid UTF-8"),
    })
}

/// Best-effort recovery of a top-level-looking `"id"` from a line that is not valid JSON.
fn sniff_id(line: &str) -> Option<JsonRpcId> {
    let start = line.find("\"id\"")? + 4;
    let rest = line[start..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();

    if let Some(body) = rest.strip_prefix('"') {
        let mut escaped = false;
        for (idx, ch) in body.char_indices() {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    let raw = &line[line.len() - body.len() - 1..][..idx + 2];
                    return serde_json::from_str::<String>(raw)
                        .ok()
                        .map(JsonRpcId::String);
                }
                _ => escaped = false,
            }
        }
        return None;
    }

    let end = rest
        .find(|ch: char| !(ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E')))
        .unwrap_or(rest.len());
    serde_json::from_str::<serde_json::Number>(&rest[..end])
        .ok()
        .map(JsonRpcId::Number)
}

pub fn encode_line(response: &JsonRpcResponse) -> Result<Vec<u8>, Error> {
    let mut bytes = serde_json::to_vec(response).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode JSON-RPC response")
            .with_source(err)
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}
