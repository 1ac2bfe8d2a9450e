//! Error types surfaced by the fabric.
//!
//! Failures a caller can act on carry an [`ErrorCode`], the string tag that
//! also travels on `error` frames. Everything else (serialization problems,
//! misuse of a half-built stream, ...) is wrapped in dedicated variants.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable failure tags, as they appear on the wire and in
/// [`Failure::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The peer frame is not open yet, or this endpoint is closed.
    #[serde(rename = "IFRAME_NOT_READY")]
    IframeNotReady,
    /// The peer window was closed or detached before the send.
    #[serde(rename = "TARGET_WINDOW_CLOSED")]
    TargetWindowClosed,
    /// No endpoint on the peer window claimed the request in time.
    #[serde(rename = "ACK_TIMEOUT")]
    AckTimeout,
    /// The claimed request produced no reply in time.
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// The handler reported asynchronous work but never finished it in time.
    #[serde(rename = "ASYNC_TIMEOUT")]
    AsyncTimeout,
    /// The peer handler failed; details are in the failure record.
    #[serde(rename = "REQUEST_ERROR")]
    RequestError,
    /// No route matched the requested path.
    #[serde(rename = "METHOD_NOT_FOUND")]
    MethodNotFound,
    /// A handler finished without sending anything and returned no value.
    #[serde(rename = "NO_RESPONSE")]
    NoResponse,
    /// The peer speaks a protocol version below the supported minimum.
    #[serde(rename = "PROTOCOL_UNSUPPORTED")]
    ProtocolUnsupported,
}

impl ErrorCode {
    /// The wire spelling of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IframeNotReady => "IFRAME_NOT_READY",
            Self::TargetWindowClosed => "TARGET_WINDOW_CLOSED",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::Timeout => "TIMEOUT",
            Self::AsyncTimeout => "ASYNC_TIMEOUT",
            Self::RequestError => "REQUEST_ERROR",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::NoResponse => "NO_RESPONSE",
            Self::ProtocolUnsupported => "PROTOCOL_UNSUPPORTED",
        }
    }

    /// Parse a wire tag back into a code.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "IFRAME_NOT_READY" => Self::IframeNotReady,
            "TARGET_WINDOW_CLOSED" => Self::TargetWindowClosed,
            "ACK_TIMEOUT" => Self::AckTimeout,
            "TIMEOUT" => Self::Timeout,
            "ASYNC_TIMEOUT" => Self::AsyncTimeout,
            "REQUEST_ERROR" => Self::RequestError,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "NO_RESPONSE" => Self::NoResponse,
            "PROTOCOL_UNSUPPORTED" => Self::ProtocolUnsupported,
            _ => return None,
        })
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request/probe as seen by the caller: the code, a human message,
/// and whatever the peer attached.
#[derive(Debug)]
#[non_exhaustive]
pub struct Failure {
    /// Failure tag.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// HTTP-style status carried by the `error` frame, when one was received.
    pub status: Option<u16>,
    /// Status text matching `status`.
    pub status_text: Option<String>,
    /// Correlation id of the request this failure belongs to.
    pub request_id: Option<String>,
    /// The addressed path, for logging.
    pub path: Option<String>,
    /// Extra payload from the peer.
    pub data: Option<Value>,
}

impl Failure {
    /// New failure with just a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            status_text: None,
            request_id: None,
            path: None,
            data: None,
        }
    }

    /// Sets the status fields and returns `Self`.
    #[must_use]
    pub fn status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        self.status = Some(status);
        self.status_text = Some(status_text.into());
        self
    }

    /// Sets the request id and returns `Self`.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the path and returns `Self`.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the extra payload and returns `Self`.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {status})")?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, " request_id={request_id}")?;
        }
        Ok(())
    }
}

/// The error type used throughout the fabric.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A request, probe or delivery failed with a caller-visible code.
    #[error("{0}")]
    Failed(Box<Failure>),
    /// A stream terminated with `stream_error` or a local producer fault.
    #[error("stream {stream_id} failed: {message}")]
    Stream {
        /// The stream the failure belongs to.
        stream_id: String,
        /// Producer-supplied message.
        message: String,
    },
    /// A stream was cancelled by either side.
    #[error("stream {stream_id} cancelled: {reason}")]
    StreamCancelled {
        /// The cancelled stream.
        stream_id: String,
        /// Cancellation reason.
        reason: String,
    },
    /// Payload could not be serialized or deserialized.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a [`Failure`].
    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        Self::Failed(Box::new(failure))
    }

    /// Shorthand for a code + message failure.
    #[must_use]
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failed(Failure::new(code, message))
    }

    /// The caller-visible code, when this error carries one.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Failed(failure) => Some(failure.code),
            _ => None,
        }
    }

    /// The failure record, when this error carries one.
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_tags_round_trip() {
        for code in [
            ErrorCode::IframeNotReady,
            ErrorCode::TargetWindowClosed,
            ErrorCode::AckTimeout,
            ErrorCode::Timeout,
            ErrorCode::AsyncTimeout,
            ErrorCode::RequestError,
            ErrorCode::MethodNotFound,
            ErrorCode::NoResponse,
            ErrorCode::ProtocolUnsupported,
        ] {
            assert_eq!(ErrorCode::from_tag(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::from_tag("NOPE"), None);
    }

    #[test]
    fn failure_display_carries_code_and_status() {
        let err = Error::failed(
            Failure::new(ErrorCode::MethodNotFound, "no handler for /z")
                .status(404, "Not Found")
                .request_id("r1"),
        );
        let text = err.to_string();
        assert!(text.contains("METHOD_NOT_FOUND"));
        assert!(text.contains("404"));
        assert!(text.contains("r1"));
        assert_eq!(err.code(), Some(ErrorCode::MethodNotFound));
    }
}
