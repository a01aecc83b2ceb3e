//! The JSON-RPC 2.0 message model.
//!
//! A message is validated exactly once, when it is decoded from JSON, into one of the shapes in
//! [`Message`].  Everything downstream of the decoder works with these types and never has to
//! poke at an untyped JSON document to figure out what kind of message it is holding.
//!
//! The id, error code and `"2.0"` marker types come from `jsonrpsee-types`; the envelopes
//! themselves are our own because a bridge has to hold on to arbitrary `params` and `result`
//! payloads without knowing their Rust types.
use jsonrpsee_types as jsonrpc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Re-use some of the heavy lifting done in jsonrpsee, pretending as if these are our own types
pub use jsonrpc::{ErrorCode, TwoPointZero};

/// Request id.  Always owned, since messages outlive the buffers they were decoded from.
pub type Id = jsonrpc::Id<'static>;

/// The `error` member of a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Make an error object whose message is the error's `Display` form, capturing the source
    /// error chain (if any) in the `data` field
    pub fn from_error(code: ErrorCode, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut data = vec![];
        let mut inner = error.source();
        while let Some(e) = inner {
            data.push(Value::String(e.to_string()));
            inner = e.source();
        }

        Self {
            code: code.code(),
            message: error.to_string(),
            data: (!data.is_empty()).then_some(Value::Array(data)),
        }
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::ParseError,
            format!("{}: {detail}", ErrorCode::ParseError.message()),
        )
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidRequest,
            format!("{}: {detail}", ErrorCode::InvalidRequest.message()),
        )
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidParams,
            format!("{}: {detail}", ErrorCode::InvalidParams.message()),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// A method invocation that expects exactly one response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: Id, method: impl Into<String>, params: impl Into<Option<Value>>) -> Self {
        Self {
            id,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// A fire-and-forget method invocation.  Must never be answered.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// The reply to a [`Request`].
///
/// Holding the outcome as a `Result` makes it impossible to build a response with both or
/// neither of `result` and `error`.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: Id,
    pub result: Result<Value, ErrorObject>,
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: Id, error: ErrorObject) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

/// Any single JSON-RPC 2.0 message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// The request id, if this message kind carries one
    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Notification(_) => None,
            Message::Response(response) => Some(&response.id),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }

    /// Validate an already-parsed JSON document as a JSON-RPC message.
    ///
    /// Batches are not supported, so anything other than a single object is rejected.
    pub fn from_value(value: Value) -> Result<Self, InvalidMessage> {
        let Value::Object(mut object) = value else {
            return Err(InvalidMessage::new(None, "expected a single JSON object"));
        };

        let id = match object.remove("id") {
            None => None,
            Some(raw) => Some(id_from_value(&raw).ok_or_else(|| {
                InvalidMessage::new(None, "`id` must be a string, a non-negative integer or null")
            })?),
        };

        match object.remove("jsonrpc") {
            Some(Value::String(version)) if version == "2.0" => {}
            _ => return Err(InvalidMessage::new(id, "`jsonrpc` must be \"2.0\"")),
        }

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(InvalidMessage::new(id, "`method` must be a string"));
            };
            let params = object.remove("params");

            return Ok(match id {
                Some(id) if !matches!(id, Id::Null) => {
                    Message::Request(Request { id, method, params })
                }
                _ => Message::Notification(Notification { method, params }),
            });
        }

        let Some(id) = id else {
            return Err(InvalidMessage::new(
                None,
                "message has no `method` and no `id`",
            ));
        };

        let result = match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(serde_json::from_value::<ErrorObject>(error).map_err(
                |e| InvalidMessage::new(Some(id.clone()), format!("malformed `error`: {e}")),
            )?),
            (Some(_), Some(_)) => {
                return Err(InvalidMessage::new(
                    Some(id),
                    "response has both `result` and `error`",
                ))
            }
            (None, None) => {
                return Err(InvalidMessage::new(
                    Some(id),
                    "message has none of `method`, `result` or `error`",
                ))
            }
        };

        Ok(Message::Response(Response { id, result }))
    }

    /// Serialize to compact JSON.
    ///
    /// Member order is fixed, so the same message always encodes to the same bytes.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Envelope<'a> {
            jsonrpc: TwoPointZero,
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<&'a Id>,
            #[serde(skip_serializing_if = "Option::is_none")]
            method: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            params: Option<&'a Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            result: Option<&'a Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            error: Option<&'a ErrorObject>,
        }

        let mut envelope = Envelope {
            jsonrpc: TwoPointZero,
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };

        match self {
            Message::Request(request) => {
                envelope.id = Some(&request.id);
                envelope.method = Some(&request.method);
                envelope.params = request.params.as_ref();
            }
            Message::Notification(notification) => {
                envelope.method = Some(&notification.method);
                envelope.params = notification.params.as_ref();
            }
            Message::Response(response) => {
                envelope.id = Some(&response.id);
                match &response.result {
                    Ok(result) => envelope.result = Some(result),
                    Err(error) => envelope.error = Some(error),
                }
            }
        }

        envelope.serialize(serializer)
    }
}

/// JSON that parsed fine but is not a JSON-RPC 2.0 message.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("invalid JSON-RPC message: {reason}")]
pub struct InvalidMessage {
    /// The id of the offending message, if one could be recovered, so the error reply can still
    /// be correlated by the client
    pub id: Option<Id>,
    pub reason: Cow<'static, str>,
}

impl InvalidMessage {
    fn new(id: Option<Id>, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Map a raw `id` member onto [`Id`].
///
/// `Id` only has room for non-negative integers, so negative and fractional ids are refused
/// along with objects and arrays.  The error reply to such a message goes out with a null id.
fn id_from_value(value: &Value) -> Option<Id> {
    match value {
        Value::Null => Some(Id::Null),
        Value::Number(number) => number.as_u64().map(Id::Number),
        Value::String(s) => Some(Id::Str(Cow::Owned(s.clone()))),
        _ => None,
    }
}
