//! Request/reply envelopes and the recoverable fault taxonomy.
//!
//! Envelopes are JSON objects in the first frame of a message:
//!
//! - request: `{"kind":"call","call":"<name>","params":{...}}`
//! - value reply: `{"status":"ok","kind":"value","value":<any>}`
//! - raw reply: `{"status":"ok","kind":"raw"}` + N payload frames
//! - image reply: `{"status":"ok","kind":"image","shape":[...],"dtype":"<name>"}` + 1 payload frame
//! - error reply: `{"status":"error","kind":"msg","msg":"<text>"}`
//!
//! Decoding goes through `serde_json::Value` so the fault taxonomy can tell
//! "not JSON" apart from "JSON of the wrong shape" apart from "params is not
//! a mapping". Reply kinds are matched exhaustively; there is no fallback
//! shape.

use serde_json::{Map, Value, json};
use tokio_util::bytes::Bytes;

use super::codec::Message;
use super::image::{Dtype, ImageError, ImageFrame};

/// Recoverable request-handling faults. Every variant becomes an error reply
/// on the wire, never a crash of the serve loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// Input was neither valid JSON nor a bare-token shorthand.
    #[error("JSON error")]
    BadJson,

    /// Parsed, but not a call envelope (missing keys, unknown kind, wrong
    /// JSON type).
    #[error("Bad request")]
    BadRequest,

    /// Call name not present in the dispatch table or the built-in helpers.
    #[error("Unknown call: {0}")]
    UnknownCall(String),

    /// `params` was not a mapping, or did not bind against the target's
    /// declared parameters.
    #[error("Bad params: {0}")]
    BadParams(String),

    /// The target failed while executing. Always caught and reported.
    #[error("Call failed: {0}")]
    Invocation(String),
}

/// A decoded call request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub call: String,
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(call: impl Into<String>) -> Self {
        Self {
            call: call.into(),
            params: Map::new(),
        }
    }

    pub fn with_params(call: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            call: call.into(),
            params,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "kind": "call",
            "call": self.call,
            "params": self.params,
        })
    }

    /// Envelope bytes for the request frame.
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_json().to_string())
    }

    /// Decode a request frame.
    ///
    /// Accepts the structured envelope, a JSON string shorthand, or a raw
    /// bare-token shorthand. The shorthand path is restricted to simple
    /// identifiers (ASCII alphanumerics, `_`, `.`, `-`); call names with any
    /// other punctuation must use the structured form.
    pub fn parse(bytes: &[u8]) -> Result<Self, Fault> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(envelope)) => Self::from_envelope(&envelope),
            Ok(Value::String(token)) => {
                if is_bare_token(&token) {
                    Ok(Request::new(token))
                } else {
                    Err(Fault::BadRequest)
                }
            }
            Ok(_) => Err(Fault::BadRequest),
            Err(_) => {
                let token = std::str::from_utf8(bytes).map(str::trim);
                match token {
                    Ok(token) if is_bare_token(token) => Ok(Request::new(token)),
                    _ => Err(Fault::BadJson),
                }
            }
        }
    }

    fn from_envelope(envelope: &Map<String, Value>) -> Result<Self, Fault> {
        let kind = envelope
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(Fault::BadRequest)?;
        if kind != "call" {
            return Err(Fault::BadRequest);
        }

        let call = envelope
            .get("call")
            .and_then(Value::as_str)
            .ok_or(Fault::BadRequest)?;

        let params = match envelope.get("params") {
            None => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => return Err(Fault::BadParams("params is not a mapping".to_string())),
        };

        Ok(Request::with_params(call, params))
    }
}

/// A bare token is a plain identifier: no spaces, no JSON punctuation.
fn is_bare_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyParseError {
    #[error("reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed reply envelope: {0}")]
    Malformed(String),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// The header frame of a reply, one variant per wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyHeader {
    Value { value: Value },
    Raw,
    Image { shape: Vec<usize>, dtype: Dtype },
    Error { msg: String },
}

impl ReplyHeader {
    pub fn to_json(&self) -> Value {
        match self {
            ReplyHeader::Value { value } => json!({
                "status": "ok",
                "kind": "value",
                "value": value,
            }),
            ReplyHeader::Raw => json!({
                "status": "ok",
                "kind": "raw",
            }),
            ReplyHeader::Image { shape, dtype } => json!({
                "status": "ok",
                "kind": "image",
                "shape": shape,
                "dtype": dtype.as_str(),
            }),
            ReplyHeader::Error { msg } => json!({
                "status": "error",
                "kind": "msg",
                "msg": msg,
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_json().to_string())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ReplyParseError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let envelope = value
            .as_object()
            .ok_or_else(|| malformed("reply is not an object"))?;

        let status = envelope
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("reply missing status"))?;
        let kind = envelope
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("reply missing kind"))?;

        match (status, kind) {
            ("ok", "value") => {
                let value = envelope
                    .get("value")
                    .cloned()
                    .ok_or_else(|| malformed("value reply missing value"))?;
                Ok(ReplyHeader::Value { value })
            }
            ("ok", "raw") => Ok(ReplyHeader::Raw),
            ("ok", "image") => {
                let shape = envelope
                    .get("shape")
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("image reply missing shape"))?
                    .iter()
                    .map(|dim| dim.as_u64().map(|d| d as usize))
                    .collect::<Option<Vec<usize>>>()
                    .ok_or_else(|| malformed("image shape is not a list of dimensions"))?;
                let dtype: Dtype = envelope
                    .get("dtype")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("image reply missing dtype"))?
                    .parse()?;
                Ok(ReplyHeader::Image { shape, dtype })
            }
            ("error", "msg") => {
                let msg = envelope
                    .get("msg")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("error reply missing msg"))?;
                Ok(ReplyHeader::Error {
                    msg: msg.to_string(),
                })
            }
            (status, kind) => Err(malformed(&format!(
                "unknown reply shape: status={status} kind={kind}"
            ))),
        }
    }
}

fn malformed(detail: &str) -> ReplyParseError {
    ReplyParseError::Malformed(detail.to_string())
}

/// A complete reply: header plus any payload frames, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Raw(Vec<Bytes>),
    Image(ImageFrame),
    Error(String),
}

impl Reply {
    /// Encode into a wire message. The payload kind fixes the shape; nothing
    /// is inferred from the data.
    pub fn encode(&self) -> Message {
        match self {
            Reply::Value(value) => vec![
                ReplyHeader::Value {
                    value: value.clone(),
                }
                .encode(),
            ],
            Reply::Raw(payloads) => {
                let mut frames = Vec::with_capacity(1 + payloads.len());
                frames.push(ReplyHeader::Raw.encode());
                frames.extend(payloads.iter().cloned());
                frames
            }
            Reply::Image(frame) => vec![
                ReplyHeader::Image {
                    shape: frame.shape().to_vec(),
                    dtype: frame.dtype(),
                }
                .encode(),
                frame.data().clone(),
            ],
            Reply::Error(msg) => vec![
                ReplyHeader::Error { msg: msg.clone() }.encode(),
            ],
        }
    }

    /// Decode a wire message into a reply, validating the frame count the
    /// header's kind demands.
    pub fn decode(message: Message) -> Result<Self, ReplyParseError> {
        let mut frames = message.into_iter();
        let header = frames
            .next()
            .ok_or_else(|| malformed("empty reply message"))?;

        match ReplyHeader::parse(&header)? {
            ReplyHeader::Value { value } => {
                if frames.next().is_some() {
                    return Err(malformed("value reply carries payload frames"));
                }
                Ok(Reply::Value(value))
            }
            ReplyHeader::Raw => Ok(Reply::Raw(frames.collect())),
            ReplyHeader::Image { shape, dtype } => {
                let data = frames
                    .next()
                    .ok_or_else(|| malformed("image reply missing payload frame"))?;
                if frames.next().is_some() {
                    return Err(malformed("image reply carries extra frames"));
                }
                Ok(Reply::Image(ImageFrame::new(shape, dtype, data)?))
            }
            ReplyHeader::Error { msg } => {
                if frames.next().is_some() {
                    return Err(malformed("error reply carries payload frames"));
                }
                Ok(Reply::Error(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let mut params = Map::new();
        params.insert("a".to_string(), json!(2));
        let request = Request::with_params("mul", params);
        assert_eq!(
            request.to_json(),
            json!({"kind": "call", "call": "mul", "params": {"a": 2}})
        );
    }

    #[test]
    fn request_round_trips() {
        let mut params = Map::new();
        params.insert("x".to_string(), json!([1, 2, 3]));
        let request = Request::with_params("vec.sum", params);
        let parsed = Request::parse(&request.encode()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn missing_params_defaults_to_empty() {
        let parsed = Request::parse(br#"{"kind":"call","call":"foo"}"#).unwrap();
        assert_eq!(parsed.call, "foo");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn bare_token_is_a_no_params_call() {
        let parsed = Request::parse(b"list-calls").unwrap();
        assert_eq!(parsed, Request::new("list-calls"));

        let parsed = Request::parse(b"  Camera.read \n").unwrap();
        assert_eq!(parsed.call, "Camera.read");
    }

    #[test]
    fn json_string_shorthand_is_accepted() {
        let parsed = Request::parse(br#""status""#).unwrap();
        assert_eq!(parsed, Request::new("status"));
    }

    #[test]
    fn json_string_with_punctuation_is_bad_request() {
        assert_eq!(
            Request::parse(br#""two words""#).unwrap_err(),
            Fault::BadRequest
        );
    }

    #[test]
    fn garbage_is_bad_json() {
        assert_eq!(Request::parse(b"{not json").unwrap_err(), Fault::BadJson);
        assert_eq!(Request::parse(b"a b: c").unwrap_err(), Fault::BadJson);
        assert_eq!(Request::parse(&[0xff, 0xfe]).unwrap_err(), Fault::BadJson);
    }

    #[test]
    fn wrong_shapes_are_bad_request() {
        assert_eq!(Request::parse(b"[1,2]").unwrap_err(), Fault::BadRequest);
        assert_eq!(Request::parse(b"42").unwrap_err(), Fault::BadRequest);
        assert_eq!(
            Request::parse(br#"{"call":"foo"}"#).unwrap_err(),
            Fault::BadRequest
        );
        assert_eq!(
            Request::parse(br#"{"kind":"cast","call":"foo"}"#).unwrap_err(),
            Fault::BadRequest
        );
        assert_eq!(
            Request::parse(br#"{"kind":"call"}"#).unwrap_err(),
            Fault::BadRequest
        );
    }

    #[test]
    fn non_mapping_params_are_bad_params() {
        let err = Request::parse(br#"{"kind":"call","call":"foo","params":[1]}"#).unwrap_err();
        assert!(matches!(err, Fault::BadParams(_)));

        let err = Request::parse(br#"{"kind":"call","call":"foo","params":null}"#).unwrap_err();
        assert!(matches!(err, Fault::BadParams(_)));
    }

    #[test]
    fn reply_header_wire_shapes() {
        assert_eq!(
            ReplyHeader::Value { value: json!(7) }.to_json(),
            json!({"status": "ok", "kind": "value", "value": 7})
        );
        assert_eq!(
            ReplyHeader::Raw.to_json(),
            json!({"status": "ok", "kind": "raw"})
        );
        assert_eq!(
            ReplyHeader::Image {
                shape: vec![480, 640, 3],
                dtype: Dtype::Uint8,
            }
            .to_json(),
            json!({"status": "ok", "kind": "image", "shape": [480, 640, 3], "dtype": "uint8"})
        );
        assert_eq!(
            ReplyHeader::Error {
                msg: "Unknown call: nope".to_string(),
            }
            .to_json(),
            json!({"status": "error", "kind": "msg", "msg": "Unknown call: nope"})
        );
    }

    #[test]
    fn value_reply_round_trips() {
        let reply = Reply::Value(json!({"answer": 42}));
        assert_eq!(Reply::decode(reply.encode()).unwrap(), reply);
    }

    #[test]
    fn raw_reply_round_trips_in_order() {
        let reply = Reply::Raw(vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"third"),
        ]);
        assert_eq!(Reply::decode(reply.encode()).unwrap(), reply);
    }

    #[test]
    fn raw_reply_may_carry_nothing() {
        let reply = Reply::Raw(Vec::new());
        let message = reply.encode();
        assert_eq!(message.len(), 1);
        assert_eq!(Reply::decode(message).unwrap(), reply);
    }

    #[test]
    fn image_reply_round_trips() {
        let data: Vec<u8> = (0..24).collect();
        let frame = ImageFrame::new(vec![2, 3, 4], Dtype::Uint8, Bytes::from(data)).unwrap();
        let reply = Reply::Image(frame.clone());

        let decoded = Reply::decode(reply.encode()).unwrap();
        let Reply::Image(decoded) = decoded else {
            panic!("expected image reply");
        };
        assert_eq!(decoded.shape(), frame.shape());
        assert_eq!(decoded.dtype(), frame.dtype());
        assert_eq!(decoded.data(), frame.data());
    }

    #[test]
    fn error_reply_round_trips() {
        let reply = Reply::Error("Bad params: missing parameter: a".to_string());
        assert_eq!(Reply::decode(reply.encode()).unwrap(), reply);
    }

    #[test]
    fn image_reply_without_payload_is_malformed() {
        let header = ReplyHeader::Image {
            shape: vec![2, 2],
            dtype: Dtype::Uint8,
        }
        .encode();
        let err = Reply::decode(vec![header]).unwrap_err();
        assert!(matches!(err, ReplyParseError::Malformed(_)));
    }

    #[test]
    fn image_reply_with_wrong_buffer_size_fails_validation() {
        let header = ReplyHeader::Image {
            shape: vec![2, 2],
            dtype: Dtype::Uint8,
        }
        .encode();
        let err = Reply::decode(vec![header, Bytes::from_static(b"xy")]).unwrap_err();
        assert!(matches!(err, ReplyParseError::Image(_)));
    }

    #[test]
    fn unknown_dtype_in_header_is_rejected() {
        let header = Bytes::from(
            json!({"status": "ok", "kind": "image", "shape": [1], "dtype": "complex64"})
                .to_string(),
        );
        let err = Reply::decode(vec![header, Bytes::from_static(b"eightbyte")]).unwrap_err();
        assert!(matches!(
            err,
            ReplyParseError::Image(ImageError::UnknownDtype(_))
        ));
    }

    #[test]
    fn unknown_reply_shape_is_malformed() {
        let header = Bytes::from(json!({"status": "ok", "kind": "tensor"}).to_string());
        let err = Reply::decode(vec![header]).unwrap_err();
        assert!(matches!(err, ReplyParseError::Malformed(_)));

        let err = ReplyHeader::parse(br#"{"kind":"value"}"#).unwrap_err();
        assert!(matches!(err, ReplyParseError::Malformed(_)));
    }
}
