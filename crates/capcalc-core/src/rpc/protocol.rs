//! Wire protocol types and framing.
//!
//! Every message is a JSON-RPC 2.0 object behind a 4-byte big-endian length
//! prefix:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Both peers send requests. Requests that produce a capability name their
//! result by question id, so later requests can refer to it as a
//! `promisedAnswer` before the reply arrives.

use crate::capability::CapabilityId;
use crate::config::RpcConfig;
use crate::error::{CalcError, Result};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// JSON-RPC 2.0 request. Requests without an `id` are notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl RpcRequest {
    /// Create a request expecting a reply to question `id`.
    pub fn new(method: Method, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            method: method.name().to_string(),
            params: Some(params),
            id: Some(id),
        }
    }

    /// Create a notification, which gets no reply.
    pub fn notification(method: Method, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            method: method.name().to_string(),
            params: Some(params),
            id: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<u64>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response carrying the structured error in `data`.
    pub fn failure(id: Option<u64>, error: &CalcError) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code: error.to_rpc_error_code(),
                message: error.to_string(),
                data: serde_json::to_value(error).ok(),
            }),
            id,
        }
    }

    /// The result payload, or the peer's error.
    pub fn into_result(self) -> Result<serde_json::Value> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error.into_calc_error()),
            (Some(result), None) => Ok(result),
            (None, None) => Err(CalcError::protocol("response has neither result nor error")),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// Recover the peer's error.
    ///
    /// Evaluation failures come back unchanged. Transport and protocol
    /// failures on the peer, and errors that cannot be decoded, surface as
    /// [`CalcError::RemoteDispatchFailure`].
    pub fn into_calc_error(self) -> CalcError {
        let typed = self
            .data
            .and_then(|data| serde_json::from_value::<CalcError>(data).ok());
        match typed {
            Some(
                error @ (CalcError::InvalidArity { .. }
                | CalcError::ArityMismatch { .. }
                | CalcError::ParameterIndexOutOfRange { .. }
                | CalcError::NoActiveFrame
                | CalcError::DivisionByZero
                | CalcError::CyclicCapability { .. }
                | CalcError::CallDepthExceeded { .. }
                | CalcError::InvalidOperator { .. }
                | CalcError::CapabilityReleased { .. }
                | CalcError::RemoteDispatchFailure { .. }),
            ) => error,
            _ => CalcError::remote(self.message),
        }
    }
}

/// Any message that can arrive on a connection.
///
/// A message with `method` is a request. Anything else must carry `result`
/// or `error` to count as a response.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl<'de> Deserialize<'de> for RpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let object = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let is_request = object.contains_key("method");
        let is_response = object.contains_key("result") || object.contains_key("error");
        let raw = serde_json::Value::Object(object);

        if is_request {
            serde_json::from_value(raw)
                .map(RpcMessage::Request)
                .map_err(de::Error::custom)
        } else if is_response {
            serde_json::from_value(raw)
                .map(RpcMessage::Response)
                .map_err(de::Error::custom)
        } else {
            Err(de::Error::custom(
                "message has neither a method nor a result or error",
            ))
        }
    }
}

/// Methods of the calculator protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Evaluate,
    DefFunction,
    GetOperator,
    Read,
    Call,
    Release,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Evaluate,
        Method::DefFunction,
        Method::GetOperator,
        Method::Read,
        Method::Call,
        Method::Release,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Evaluate => "calculator.evaluate",
            Method::DefFunction => "calculator.defFunction",
            Method::GetOperator => "calculator.getOperator",
            Method::Read => "value.read",
            Method::Call => "function.call",
            Method::Release => "release",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.name() == name)
    }

    /// Interface the method belongs to; `None` for session control.
    pub fn interface(self) -> Option<&'static str> {
        match self {
            Method::Evaluate | Method::DefFunction | Method::GetOperator => Some("Calculator"),
            Method::Read => Some("Value"),
            Method::Call => Some("Function"),
            Method::Release => None,
        }
    }

    /// Stable ordinal within the interface.
    pub fn ordinal(self) -> Option<u16> {
        match self {
            Method::Evaluate | Method::Read | Method::Call => Some(0),
            Method::DefFunction => Some(1),
            Method::GetOperator => Some(2),
            Method::Release => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to a capability, relative to the message's sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireCap {
    /// Exported by the sender under this id.
    SenderHosted(CapabilityId),
    /// Previously exported by the receiver under this id.
    ReceiverHosted(CapabilityId),
    /// The capability produced by the sender's question with this id.
    PromisedAnswer(u64),
}

/// An `f64` that survives JSON: non-finite values travel as strings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireF64(pub f64);

impl Serialize for WireF64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = self.0;
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }
}

impl<'de> Deserialize<'de> for WireF64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(WireF64(value)),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(WireF64(f64::NAN)),
                "inf" => Ok(WireF64(f64::INFINITY)),
                "-inf" => Ok(WireF64(f64::NEG_INFINITY)),
                other => Err(de::Error::custom(format!("invalid number: {other}"))),
            },
        }
    }
}

/// Expression tree with capabilities replaced by wire references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireExpression {
    Literal(WireF64),
    PreviousResult(WireCap),
    Parameter(u32),
    Call(WireCall),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCall {
    pub function: WireCap,
    pub params: Vec<WireExpression>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateParams {
    pub expression: WireExpression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefFunctionParams {
    pub param_count: i32,
    pub body: WireExpression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOperatorParams {
    pub op: u16,
}

/// Params of `value.read` and `release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetParams {
    pub target: WireCap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    pub target: WireCap,
    pub params: Vec<WireF64>,
}

/// Result of `calculator.evaluate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueResult {
    pub value: WireCap,
}

/// Result of `calculator.defFunction` and `calculator.getOperator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResult {
    pub func: WireCap,
}

/// Result of `value.read` and `function.call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberResult {
    pub value: WireF64,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(CalcError::Validation {
            field: "rpc_frame".to_string(),
            message: format!(
                "RPC message size {} exceeds maximum {}",
                len,
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(CalcError::Validation {
            field: "rpc_frame".to_string(),
            message: format!(
                "RPC message size {} exceeds maximum {}",
                payload.len(),
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
