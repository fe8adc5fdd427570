// JSON-RPC 2.0 message model shared by both ends of the overlay bridge.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Wire error codes.
pub mod codes {
    // JSON-RPC 2.0 standard errors
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Server errors
    pub const LIFECYCLE_VIOLATION: i32 = -32001;
    pub const TIMEOUT: i32 = -32002;
}

/// Request correlation id. Numbers are what this crate issues; strings are
/// accepted from peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{}", n),
            RpcId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error(details: impl fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {}", details))
    }

    pub fn invalid_request(details: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {}", details))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(details: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {}", details))
    }
}

/// The fixed method set spoken over the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    // Served by the host
    GetServerReadHandle,
    GetServerWriteHandle,
    SurfaceCreated,
    SurfaceDestroyed,
    ForwardPointerEvent,
    ForwardWheelEvent,
    ForwardKeyEvent,

    // Served by the target
    SetSharedTextureHandle,
    SetMouseCursor,

    Unknown(String),
}

impl Method {
    pub fn parse(name: &str) -> Self {
        match name {
            "GetServerReadHandle" => Method::GetServerReadHandle,
            "GetServerWriteHandle" => Method::GetServerWriteHandle,
            "SurfaceCreated" => Method::SurfaceCreated,
            "SurfaceDestroyed" => Method::SurfaceDestroyed,
            "ForwardPointerEvent" => Method::ForwardPointerEvent,
            "ForwardWheelEvent" => Method::ForwardWheelEvent,
            "ForwardKeyEvent" => Method::ForwardKeyEvent,
            "SetSharedTextureHandle" => Method::SetSharedTextureHandle,
            "SetMouseCursor" => Method::SetMouseCursor,
            other => Method::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GetServerReadHandle => "GetServerReadHandle",
            Method::GetServerWriteHandle => "GetServerWriteHandle",
            Method::SurfaceCreated => "SurfaceCreated",
            Method::SurfaceDestroyed => "SurfaceDestroyed",
            Method::ForwardPointerEvent => "ForwardPointerEvent",
            Method::ForwardWheelEvent => "ForwardWheelEvent",
            Method::ForwardKeyEvent => "ForwardKeyEvent",
            Method::SetSharedTextureHandle => "SetSharedTextureHandle",
            Method::SetMouseCursor => "SetMouseCursor",
            Method::Unknown(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        method: Method,
        params: Vec<Value>,
        id: RpcId,
    },
    Notification {
        method: Method,
        params: Vec<Value>,
    },
    Response {
        result: Value,
        id: RpcId,
    },
    ErrorResponse {
        error: RpcError,
        id: Option<RpcId>,
    },
}

/// A message that could not be decoded, with the id when one was readable.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    pub id: Option<RpcId>,
    pub error: RpcError,
}

impl InvalidMessage {
    fn new(id: Option<RpcId>, error: RpcError) -> Self {
        Self { id, error }
    }

    /// Error frame answering this message, if the sender can correlate it.
    pub fn into_reply(self) -> Option<RpcMessage> {
        self.id.map(|id| RpcMessage::ErrorResponse {
            error: self.error,
            id: Some(id),
        })
    }
}

pub type Decoded = Result<RpcMessage, InvalidMessage>;

impl RpcMessage {
    pub fn error_reply(id: RpcId, error: RpcError) -> Self {
        RpcMessage::ErrorResponse {
            error,
            id: Some(id),
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            RpcMessage::Response { .. } | RpcMessage::ErrorResponse { .. }
        )
    }

    pub fn to_value(&self) -> Value {
        match self {
            RpcMessage::Request { method, params, id } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method.as_str(),
                "params": params,
                "id": id,
            }),
            RpcMessage::Notification { method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method.as_str(),
                "params": params,
            }),
            RpcMessage::Response { result, id } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "result": result,
                "id": id,
            }),
            RpcMessage::ErrorResponse { error, id } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "error": error,
                "id": id,
            }),
        }
    }

    /// Classify one JSON value as a message.
    pub fn from_value(value: Value) -> Decoded {
        let Value::Object(mut obj) = value else {
            return Err(InvalidMessage::new(
                None,
                RpcError::invalid_request("message is not an object"),
            ));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => match serde_json::from_value::<RpcId>(raw) {
                Ok(id) => Some(id),
                Err(_) => {
                    return Err(InvalidMessage::new(
                        None,
                        RpcError::invalid_request("id must be a number or a string"),
                    ))
                }
            },
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            other => {
                return Err(InvalidMessage::new(
                    id,
                    RpcError::invalid_request(format!(
                        "unsupported jsonrpc version {:?}",
                        other
                    )),
                ))
            }
        }

        if let Some(method) = obj.get("method") {
            let Some(name) = method.as_str() else {
                return Err(InvalidMessage::new(
                    id,
                    RpcError::invalid_request("method must be a string"),
                ));
            };
            let method = Method::parse(name);
            let params = match obj.remove("params") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(params)) => params,
                Some(_) => {
                    return Err(InvalidMessage::new(
                        id,
                        RpcError::invalid_params("only positional params are supported"),
                    ))
                }
            };
            return Ok(match id {
                Some(id) => RpcMessage::Request { method, params, id },
                None => RpcMessage::Notification { method, params },
            });
        }

        if let Some(result) = obj.remove("result") {
            return match id {
                Some(id) => Ok(RpcMessage::Response { result, id }),
                None => Err(InvalidMessage::new(
                    None,
                    RpcError::invalid_request("response without id"),
                )),
            };
        }

        if let Some(error) = obj.remove("error") {
            return match serde_json::from_value::<RpcError>(error) {
                Ok(error) => Ok(RpcMessage::ErrorResponse { error, id }),
                Err(e) => Err(InvalidMessage::new(
                    None,
                    RpcError::invalid_request(format!("malformed error object: {}", e)),
                )),
            };
        }

        Err(InvalidMessage::new(
            id,
            RpcError::invalid_request("neither method, result nor error present"),
        ))
    }
}

/// What one transport frame carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(RpcMessage),
    Batch(Vec<RpcMessage>),
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Frame::Single(message) => serde_json::to_string(&message.to_value()),
            Frame::Batch(messages) => serde_json::to_string(&Value::Array(
                messages.iter().map(RpcMessage::to_value).collect(),
            )),
        }
    }
}

/// Decoded inbound frame. Batch elements are decoded independently so one
/// bad element does not poison its siblings.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Single(Decoded),
    Batch(Vec<Decoded>),
}

pub fn decode_frame(text: &str) -> Result<Inbound, InvalidMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| InvalidMessage::new(None, RpcError::parse_error(e)))?;

    match value {
        Value::Array(items) if items.is_empty() => Err(InvalidMessage::new(
            None,
            RpcError::invalid_request("empty batch"),
        )),
        Value::Array(items) => Ok(Inbound::Batch(
            items.into_iter().map(RpcMessage::from_value).collect(),
        )),
        single => Ok(Inbound::Single(RpcMessage::from_value(single))),
    }
}

/// A 64-bit OS handle value as it crosses the process boundary.
///
/// Serialized as `{"lo": i32, "hi": i32}` so peers limited to 53-bit numbers
/// keep every bit. Plain integers are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleValue(pub u64);

impl HandleValue {
    /// `INVALID_HANDLE_VALUE`, used to tell the target there is no surface.
    pub const INVALID: HandleValue = HandleValue(u64::MAX);

    pub fn from_parts(lo: i64, hi: i64) -> Self {
        let lo = (lo as u64) & 0xFFFF_FFFF;
        let hi = (hi as u64) & 0xFFFF_FFFF;
        HandleValue((hi << 32) | lo)
    }

    pub fn lo(self) -> i32 {
        (self.0 & 0xFFFF_FFFF) as u32 as i32
    }

    pub fn hi(self) -> i32 {
        (self.0 >> 32) as u32 as i32
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for HandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SplitRepr {
    Parts { lo: i64, hi: i64 },
    Signed(i64),
    Unsigned(u64),
}

impl Serialize for HandleValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = Map::new();
        map.insert("lo".into(), Value::from(self.lo()));
        map.insert("hi".into(), Value::from(self.hi()));
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HandleValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match SplitRepr::deserialize(deserializer)? {
            SplitRepr::Parts { lo, hi } => HandleValue::from_parts(lo, hi),
            SplitRepr::Signed(v) => HandleValue(v as u64),
            SplitRepr::Unsigned(v) => HandleValue(v),
        })
    }
}

/// Locally unique identifier of a graphics adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AdapterLuid {
    pub lo: u32,
    pub hi: i32,
}

impl AdapterLuid {
    pub fn new(lo: u32, hi: i32) -> Self {
        Self { lo, hi }
    }
}

impl fmt::Display for AdapterLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.hi as u32, self.lo)
    }
}

impl<'de> Deserialize<'de> for AdapterLuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = match SplitRepr::deserialize(deserializer)? {
            SplitRepr::Parts { lo, hi } => HandleValue::from_parts(lo, hi),
            SplitRepr::Signed(v) => HandleValue(v as u64),
            SplitRepr::Unsigned(v) => HandleValue(v),
        };
        Ok(AdapterLuid::new(value.lo() as u32, value.hi()))
    }
}
