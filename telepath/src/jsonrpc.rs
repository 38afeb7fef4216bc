//! JSON-RPC 2.0 framing for channel messages.
//!
//! Every message on a secure channel is one JSON-RPC envelope. Inbound
//! envelopes are classified once, at parse time, into [`InboundMessage`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Request identifier: absent, a number or a string.
///
/// Equality follows the JSON value, so `42` and `"42"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum JsonRpcId {
    /// No id (notifications, or responses to unparsable requests).
    #[default]
    None,
    /// Numeric id.
    Number(Number),
    /// String id.
    String(String),
}

impl JsonRpcId {
    /// The absent id.
    pub fn none() -> Self {
        Self::None
    }

    /// True for the absent id.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Integer value, if this is an integral numeric id.
    pub fn number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// String value, if this is a string id.
    pub fn string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The id as a JSON value (`null` when absent).
    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    fn is_valid_value(value: &Value) -> bool {
        matches!(value, Value::Null | Value::Number(_) | Value::String(_))
    }
}

impl From<Value> for JsonRpcId {
    /// Values other than numbers and strings become [`JsonRpcId::None`].
    fn from(value: Value) -> Self {
        match value {
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            _ => Self::None,
        }
    }
}

impl From<i64> for JsonRpcId {
    fn from(id: i64) -> Self {
        Self::Number(id.into())
    }
}

impl From<u64> for JsonRpcId {
    fn from(id: u64) -> Self {
        Self::Number(id.into())
    }
}

impl From<&str> for JsonRpcId {
    fn from(id: &str) -> Self {
        Self::String(id.to_owned())
    }
}

impl From<String> for JsonRpcId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("null"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

/// Hands out request ids for one channel.
///
/// Starts at a random offset so that a restarted endpoint does not reuse ids
/// its peer may still remember, then counts up.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Generator with a random starting point.
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(1..=u64::from(u32::MAX)))
    }

    /// Generator starting at `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Next unused id.
    pub fn next_id(&self) -> JsonRpcId {
        JsonRpcId::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error object of a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    /// Stable, caller-visible error code.
    pub code: i64,
    /// Human readable description.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error with a code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured details.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32700`
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    /// `-32600`
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    /// `-32601`
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32602`
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// `-32603`
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// A call or, when the id is absent, a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// Correlation id; [`JsonRpcId::None`] for notifications.
    pub id: JsonRpcId,
    /// Method name.
    pub method: String,
    /// Parameters (an object unless the peer sent an array).
    pub params: Value,
}

impl JsonRpcRequest {
    /// Request without an id; the channel assigns one when sending.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_id(JsonRpcId::None, method, params)
    }

    /// Request with an explicit id.
    pub fn with_id(id: impl Into<JsonRpcId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// True when no response is expected.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// A parameter by name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// A string parameter by name.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }

    /// Parse a single request envelope.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match InboundMessage::parse(bytes) {
            InboundMessage::Request(request) | InboundMessage::Notification(request) => {
                Some(request)
            }
            _ => None,
        }
    }
}

impl Serialize for JsonRpcRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        if !self.id.is_none() {
            map.serialize_entry("id", &self.id)?;
        }
        map.serialize_entry("method", &self.method)?;
        map.serialize_entry("params", &self.params)?;
        map.end()
    }
}

/// Answer to a request: exactly one of result or error.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// Id of the request being answered.
    pub id: JsonRpcId,
    /// `Ok(result)` or `Err(error)`.
    pub outcome: Result<Value, JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response.
    pub fn result(id: JsonRpcId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    /// Error response.
    pub fn error(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

impl Serialize for JsonRpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Ok(result) => map.serialize_entry("result", result)?,
            Err(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

/// An inbound envelope, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Has a method and an id.
    Request(JsonRpcRequest),
    /// Has a method but no id.
    Notification(JsonRpcRequest),
    /// Has no method and carries a result or an error.
    Response(JsonRpcResponse),
    /// Anything else, with the reason it was rejected.
    Malformed(String),
}

/// Wire shape before classification.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Keeps an explicit `null` distinct from a missing field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl InboundMessage {
    /// Parse and classify raw JSON.
    pub fn parse(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Envelope>(bytes) {
            Ok(envelope) => Self::classify(envelope),
            Err(e) => Self::Malformed(format!("invalid envelope: {e}")),
        }
    }

    fn classify(envelope: Envelope) -> Self {
        if let Some(version) = envelope.jsonrpc.as_deref() {
            if version != JSONRPC_VERSION {
                return Self::Malformed(format!("unsupported jsonrpc version {version:?}"));
            }
        }

        let id = match envelope.id {
            Some(value) if JsonRpcId::is_valid_value(&value) => JsonRpcId::from(value),
            Some(_) => return Self::Malformed("id must be a number, a string or null".into()),
            None => JsonRpcId::None,
        };

        if let Some(method) = envelope.method {
            if envelope.result.is_some() || envelope.error.is_some() {
                return Self::Malformed("request carries a result or an error".into());
            }
            let params = match envelope.params {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(params @ (Value::Object(_) | Value::Array(_))) => params,
                Some(_) => return Self::Malformed("params must be an object or an array".into()),
            };
            let request = JsonRpcRequest { id, method, params };
            return if request.is_notification() {
                Self::Notification(request)
            } else {
                Self::Request(request)
            };
        }

        match (envelope.result, envelope.error) {
            (Some(result), None) => Self::Response(JsonRpcResponse::result(id, result)),
            (None, Some(error)) => Self::Response(JsonRpcResponse::error(id, error)),
            _ => Self::Malformed("response must carry exactly one of result or error".into()),
        }
    }
}
