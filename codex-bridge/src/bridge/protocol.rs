//! Wire protocol types for the app-server line protocol.
//!
//! One JSON object per line, no `jsonrpc` version field. The shape is decided
//! by which of `id` and `method` are present:
//! - **Request** (`method` + `id`): expects exactly one Response
//! - **Response** (`id` + `result` or `error`)
//! - **Notification** (`method`, `id` absent or null)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type RequestId = u64;

/// Id used by the `initialize` handshake. The engine's counter starts above it.
pub const HANDSHAKE_ID: RequestId = 0;

/// Structured error object carried by an error Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    #[serde(default = "default_error_code")]
    pub code: i64,
    #[serde(default = "default_error_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_error_code() -> i64 {
    -1
}

fn default_error_message() -> String {
    "Unknown error".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub id: RequestId,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self::Request(Request {
            method: method.into(),
            id,
            params: object_or_empty(params),
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params: object_or_empty(params),
        })
    }

    pub fn response(id: RequestId, outcome: Result<Value, RpcError>) -> Self {
        Self::Response(Response { id, outcome })
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Request(r) => Some(r.id),
            Self::Response(r) => Some(r.id),
            Self::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

/// `null` params are sent as `{}`.
fn object_or_empty(params: Value) -> Value {
    if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    }
}

/// Flat wire form shared by all three shapes.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = String;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let params = object_or_empty(raw.params.unwrap_or(Value::Null));
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request(Request { method, id, params })),
            (Some(id), None) => {
                let outcome = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(object_or_empty(raw.result.unwrap_or(Value::Null))),
                };
                Ok(Self::Response(Response { id, outcome }))
            }
            (None, Some(method)) => Ok(Self::Notification(Notification { method, params })),
            (None, None) => Err("message carries neither id nor method".to_string()),
        }
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let mut raw = RawEnvelope {
            method: None,
            id: None,
            params: None,
            result: None,
            error: None,
        };
        match envelope {
            Envelope::Request(r) => {
                raw.method = Some(r.method);
                raw.id = Some(r.id);
                raw.params = Some(r.params);
            }
            Envelope::Response(r) => {
                raw.id = Some(r.id);
                match r.outcome {
                    Ok(result) => raw.result = Some(result),
                    Err(error) => raw.error = Some(error),
                }
            }
            Envelope::Notification(n) => {
                raw.method = Some(n.method);
                raw.params = Some(n.params);
            }
        }
        raw
    }
}
