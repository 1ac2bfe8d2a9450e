//! The wire protocol: every message that crosses a window boundary is a
//! [`Frame`] serialized to a JSON value.
//!
//! Anything arriving on a window that does not decode into a `Frame` is not
//! ours and is dropped without comment; the version marker field doubles as
//! the structural discriminant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version stamped on outgoing frames.
pub const PROTOCOL_VERSION: u64 = 2;
/// Oldest protocol version this build still accepts.
pub const MIN_SUPPORTED_VERSION: u64 = 1;

/// Longest `ack.id` echoed back verbatim; larger ids drop the whole echo.
pub const MAX_ACK_ID_LEN: usize = 64;
/// Longest `ack.meta` echoed back; larger metas are stripped from the echo.
pub const MAX_ACK_META_LEN: usize = 256;

/// Frame kind names. Kinds are open-ended strings so that families such as
/// `stream_*` can be matched by prefix.
pub mod kind {
    /// A routed request.
    pub const REQUEST: &str = "request";
    /// Receipt confirmation for a claimed frame.
    pub const ACK: &str = "ack";
    /// The handler went asynchronous; the reply will take longer.
    pub const ASYNC: &str = "async";
    /// A successful reply.
    pub const RESPONSE: &str = "response";
    /// A failed reply.
    pub const ERROR: &str = "error";
    /// Connectivity probe.
    pub const PING: &str = "ping";
    /// Probe answer.
    pub const PONG: &str = "pong";
    /// Stream handshake.
    pub const STREAM_START: &str = "stream_start";
    /// One stream chunk.
    pub const STREAM_DATA: &str = "stream_data";
    /// Normal stream termination.
    pub const STREAM_END: &str = "stream_end";
    /// Producer-side stream failure.
    pub const STREAM_ERROR: &str = "stream_error";
    /// Cancellation, from either side.
    pub const STREAM_CANCEL: &str = "stream_cancel";
    /// Consumer-granted credit for more chunks.
    pub const STREAM_PULL: &str = "stream_pull";
    /// Prefix shared by all stream frames.
    pub const STREAM_PREFIX: &str = "stream_";
}

/// Which side of the fabric sent a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The requesting side.
    Client,
    /// The answering side.
    Server,
}

impl Role {
    /// The opposite role.
    #[must_use]
    pub fn peer(&self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Echo payload binding an `ack` frame to one specific send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEcho {
    /// Sender-chosen id the receiver must echo back.
    pub id: String,
    /// Free-form annotation, dropped from echoes when oversized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
}

impl AckEcho {
    /// New echo with a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: random_id(16),
            meta: None,
        }
    }

    /// Size-bound this echo for a reply: oversized `meta` is stripped,
    /// an oversized `id` makes the echo unusable entirely.
    #[must_use]
    pub fn bounded(&self) -> Option<Self> {
        if self.id.chars().count() > MAX_ACK_ID_LEN {
            return None;
        }
        let meta = self
            .meta
            .clone()
            .filter(|meta| meta.chars().count() <= MAX_ACK_META_LEN);
        Some(Self {
            id: self.id.clone(),
            meta,
        })
    }
}

/// Error payload on `error` frames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failure tag, see [`crate::ErrorCode`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A single wire message.
///
/// `version`, `timestamp`, `kind` and `request_id` are always present; the
/// rest depends on the kind. Unknown extra fields from newer peers are kept
/// in `extra` so they survive logging and re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Protocol version marker. The field name is the structural tag that
    /// separates fabric traffic from every other message on the window.
    #[serde(rename = "__requestIframe__")]
    pub version: u64,
    /// Sender wall clock, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    /// Frame kind, see [`kind`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id of the logical request or stream.
    pub request_id: String,
    /// Sender role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Endpoint instance id of the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    /// Intended receiver endpoint id; absent means "any listener".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Channel-isolation tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Route string for requests; echoed on some replies for logging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Request body or stream control body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Response payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// HTTP-style headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    /// Request cookies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Value>,
    /// HTTP-style status code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Status text matching `status`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    /// Error payload on `error` frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// The receiver must reply `ack` once it claims this frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_ack: Option<bool>,
    /// Echo payload for ack binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckEcho>,
    /// Stream id on requests that carry a stream body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Fields from newer protocol revisions, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Frame {
    /// New frame of `kind` for `request_id`, stamped with the current
    /// protocol version and wall clock.
    #[must_use]
    pub fn new(kind: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            timestamp: now_millis(),
            kind: kind.into(),
            request_id: request_id.into(),
            role: None,
            creator_id: None,
            target_id: None,
            secret_key: None,
            path: None,
            body: None,
            data: None,
            headers: None,
            cookies: None,
            status: None,
            status_text: None,
            error: None,
            require_ack: None,
            ack: None,
            stream_id: None,
            extra: Map::new(),
        }
    }

    /// Try to decode a raw window payload into a frame.
    ///
    /// `None` means "not fabric traffic".
    #[must_use]
    pub fn decode(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Encode for the wire.
    pub fn encode(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// `true` when the receiver asked for an ack.
    #[must_use]
    pub fn wants_ack(&self) -> bool {
        self.require_ack == Some(true)
    }

    /// `true` for any `stream_*` frame, handshake included.
    #[must_use]
    pub fn is_stream_kind(&self) -> bool {
        self.kind.starts_with(kind::STREAM_PREFIX)
    }

    /// Sets the sender role and returns `Self`.
    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Sets the sender endpoint id and returns `Self`.
    #[must_use]
    pub fn with_creator(mut self, creator_id: impl Into<String>) -> Self {
        self.creator_id = Some(creator_id.into());
        self
    }

    /// Sets the receiver endpoint id and returns `Self`.
    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Sets the path and returns `Self`.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the body and returns `Self`.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the response payload and returns `Self`.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the headers and returns `Self`.
    #[must_use]
    pub fn with_headers(mut self, headers: Value) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Sets the cookies and returns `Self`.
    #[must_use]
    pub fn with_cookies(mut self, cookies: Value) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// Sets status and status text and returns `Self`.
    #[must_use]
    pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        self.status = Some(status);
        self.status_text = Some(status_text.into());
        self
    }

    /// Sets the error payload and returns `Self`.
    #[must_use]
    pub fn with_error(mut self, error: ErrorPayload) -> Self {
        self.error = Some(error);
        self
    }

    /// Sets the ack requirement and returns `Self`.
    #[must_use]
    pub fn with_require_ack(mut self, require_ack: bool) -> Self {
        self.require_ack = Some(require_ack);
        self
    }

    /// Sets the ack echo and returns `Self`.
    #[must_use]
    pub fn with_ack(mut self, ack: AckEcho) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Sets the stream id and returns `Self`.
    #[must_use]
    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Random alphanumeric id of `len` characters.
#[must_use]
pub fn random_id(len: usize) -> String {
    use rand::Rng;
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_round_trips_with_camel_case_names() {
        let frame = Frame::new(kind::REQUEST, "r1")
            .with_role(Role::Client)
            .with_creator("c1")
            .with_path("/users")
            .with_body(json!({"id": 7}))
            .with_require_ack(true);
        let value = frame.encode().expect("encode");
        assert_eq!(value["__requestIframe__"], json!(PROTOCOL_VERSION));
        assert_eq!(value["type"], json!("request"));
        assert_eq!(value["requestId"], json!("r1"));
        assert_eq!(value["creatorId"], json!("c1"));
        assert_eq!(value["requireAck"], json!(true));
        assert_eq!(value["role"], json!("client"));

        let back = Frame::decode(&value).expect("decode");
        assert_eq!(back.kind, kind::REQUEST);
        assert_eq!(back.request_id, "r1");
        assert_eq!(back.role, Some(Role::Client));
        assert_eq!(back.body, Some(json!({"id": 7})));
    }

    #[test]
    fn decode_rejects_foreign_messages() {
        assert!(Frame::decode(&json!("just a string")).is_none());
        assert!(Frame::decode(&json!({"hello": "world"})).is_none());
        // Version present but the other required fields missing.
        assert!(Frame::decode(&json!({"__requestIframe__": 2})).is_none());
        // Version of the wrong type.
        assert!(
            Frame::decode(&json!({
                "__requestIframe__": "2",
                "type": "request",
                "requestId": "r1",
                "timestamp": 0,
            }))
            .is_none()
        );
    }

    #[test]
    fn decode_keeps_unknown_fields() {
        let value = json!({
            "__requestIframe__": 3,
            "timestamp": 1,
            "type": "request",
            "requestId": "r1",
            "futureField": {"x": 1},
        });
        let frame = Frame::decode(&value).expect("decode");
        assert_eq!(frame.version, 3);
        assert_eq!(frame.extra["futureField"], json!({"x": 1}));
    }

    #[test]
    fn ack_echo_bounds() {
        let ok = AckEcho {
            id: "a".repeat(MAX_ACK_ID_LEN),
            meta: Some("m".repeat(MAX_ACK_META_LEN)),
        };
        let bounded = ok.bounded().expect("in bounds");
        assert!(bounded.meta.is_some());

        let oversize_meta = AckEcho {
            id: "a".into(),
            meta: Some("m".repeat(MAX_ACK_META_LEN + 1)),
        };
        let bounded = oversize_meta.bounded().expect("id ok");
        assert_eq!(bounded.meta, None);

        let oversize_id = AckEcho {
            id: "a".repeat(MAX_ACK_ID_LEN + 1),
            meta: None,
        };
        assert!(oversize_id.bounded().is_none());
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(random_id(16), random_id(16));
        assert_eq!(random_id(8).len(), 8);
    }
}
