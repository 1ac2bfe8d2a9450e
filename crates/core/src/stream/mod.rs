//! The stream protocol: chunked bodies riding on `stream_*` frames.
//!
//! A stream lives under one `stream_id`. The producer side is a
//! [`WritableStream`] that negotiates with `stream_start` and emits chunks
//! against receiver-granted credit; the consumer side is a
//! [`ReadableStream`] fed by the per-endpoint [`StreamDispatcher`]. File
//! transfer is a thin specialization that base64-codes the chunks.

mod file;
mod readable;
mod writable;

pub use file::{FileContent, FileReadableStream, FileStreamOptions, FileWritableStream};
pub use readable::ReadableStream;
pub(crate) use readable::ReplyContext;
pub use writable::{
    BindContext, ChunkSource, DEFAULT_CHUNK_SIZE, ResponseHead, StreamOptions, WritableStream,
};

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::MessageContext;
use crate::proto::Frame;

/// Chunks granted per credit window.
pub(crate) const CREDIT_WINDOW: u64 = 16;
/// Remaining credit at which the consumer grants another window.
pub(crate) const CREDIT_LOW_WATER: u64 = 4;

/// What a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Arbitrary JSON chunks.
    Data,
    /// Base64-encoded file content.
    File,
}

/// Lifecycle of a stream, on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Created, not yet started.
    Pending,
    /// Frames are flowing.
    Active,
    /// Terminated normally.
    Ended,
    /// Terminated by a cancel, from either side.
    Cancelled,
    /// Terminated by an error.
    Failed,
}

impl StreamStatus {
    /// `true` once the stream can no longer move.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled | Self::Failed)
    }
}

/// Body payload of every `stream_*` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    /// The stream this frame belongs to.
    pub stream_id: String,
    /// Stream kind, on `stream_start`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamKind>,
    /// Whether the payload arrives in many chunks, on `stream_start`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunked: Option<bool>,
    /// Producer-supplied metadata, on `stream_start`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Ask the receiver to materialize the whole payload before delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_resolve: Option<bool>,
    /// Chunk payload, on `stream_data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Marks the final chunk of a non-chunked payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// Failure message, on `stream_error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Cancellation reason, on `stream_cancel`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Granted chunk credit, on `stream_pull`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit: Option<u64>,
}

impl StreamBody {
    /// New body for `stream_id`.
    #[must_use]
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            ..Self::default()
        }
    }

    /// Decode the body of a `stream_*` frame.
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let body = frame.body.as_ref()?;
        serde_json::from_value(body.clone()).ok()
    }

    /// Encode for the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Handler invoked with every frame of one registered stream.
pub type StreamFrameHandler = Arc<dyn Fn(&Frame, &StreamBody) + Send + Sync>;

struct StreamDispatcherInner {
    instance_id: String,
    handlers: Mutex<HashMap<String, StreamFrameHandler>>,
}

/// Demultiplexes `stream_*` frames to per-stream handlers.
///
/// Frames for a `stream_id` nobody registered are ignored; a chunk that
/// races a late registration or a finished stream must never take the
/// endpoint down. A frame whose stream is known here is claimed on the
/// delivery context so co-resident endpoints do not double-dispatch it.
#[derive(Clone)]
pub struct StreamDispatcher {
    inner: Arc<StreamDispatcherInner>,
}

impl StreamDispatcher {
    /// New dispatcher for the endpoint `instance_id`.
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StreamDispatcherInner {
                instance_id: instance_id.into(),
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Route frames for `stream_id` to `handler`.
    pub fn register(&self, stream_id: impl Into<String>, handler: StreamFrameHandler) {
        self.inner.handlers.lock().insert(stream_id.into(), handler);
    }

    /// Stop routing `stream_id`.
    pub fn unregister(&self, stream_id: &str) {
        self.inner.handlers.lock().remove(stream_id);
    }

    /// Whether `stream_id` has a handler.
    #[must_use]
    pub fn is_registered(&self, stream_id: &str) -> bool {
        self.inner.handlers.lock().contains_key(stream_id)
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Whether no streams are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one `stream_*` frame.
    pub fn dispatch(&self, frame: &Frame, context: &MessageContext) {
        let Some(body) = StreamBody::from_frame(frame) else {
            tracing::debug!(kind = %frame.kind, "stream frame without a usable body, ignoring");
            return;
        };
        let handler = self.inner.handlers.lock().get(&body.stream_id).cloned();
        let Some(handler) = handler else {
            tracing::trace!(stream_id = %body.stream_id, kind = %frame.kind,
                "no handler for stream, ignoring frame");
            return;
        };
        // Claim the delivery so a co-resident endpoint leaves it alone; if
        // someone else already owns it, this frame is theirs.
        if let Some(owner) = context.handled_by() {
            if owner != self.inner.instance_id {
                return;
            }
        }
        context.mark_accepted_by(&self.inner.instance_id);
        handler(frame, &body);
    }
}

impl Debug for StreamDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDispatcher")
            .field("instance_id", &self.inner.instance_id)
            .field("streams", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::kind;

    fn data_frame(stream_id: &str) -> Frame {
        Frame::new(kind::STREAM_DATA, "r1").with_body(
            StreamBody {
                data: Some(Value::from(1)),
                ..StreamBody::new(stream_id)
            }
            .to_value(),
        )
    }

    #[test]
    fn unknown_stream_is_ignored() {
        let dispatcher = StreamDispatcher::new("e1");
        let context = MessageContext::new("https://peer.test", None);
        // No handler registered: nothing happens, nothing panics.
        dispatcher.dispatch(&data_frame("missing"), &context);
        assert!(context.handled_by().is_none());
    }

    #[test]
    fn dispatch_claims_and_routes() {
        let dispatcher = StreamDispatcher::new("e1");
        let hits = Arc::new(Mutex::new(Vec::new()));
        {
            let hits = Arc::clone(&hits);
            dispatcher.register(
                "s1",
                Arc::new(move |frame, body| {
                    hits.lock().push((frame.kind.clone(), body.stream_id.clone()));
                }),
            );
        }
        let context = MessageContext::new("https://peer.test", None);
        dispatcher.dispatch(&data_frame("s1"), &context);
        assert_eq!(context.accepted_by().as_deref(), Some("e1"));
        assert_eq!(hits.lock().len(), 1);

        // Claimed by someone else: hands off.
        let foreign = MessageContext::new("https://peer.test", None);
        foreign.mark_handled_by("other");
        dispatcher.dispatch(&data_frame("s1"), &foreign);
        assert_eq!(hits.lock().len(), 1);
    }

    #[test]
    fn stream_body_round_trip() {
        let body = StreamBody {
            kind: Some(StreamKind::File),
            chunked: Some(false),
            auto_resolve: Some(true),
            metadata: Some(serde_json::json!({"filename": "a.txt"})),
            ..StreamBody::new("s9")
        };
        let value = body.to_value();
        assert_eq!(value["streamId"], "s9");
        assert_eq!(value["type"], "file");
        assert_eq!(value["autoResolve"], true);
        let frame = Frame::new(kind::STREAM_START, "r1").with_body(value);
        let back = StreamBody::from_frame(&frame).expect("decode");
        assert_eq!(back.kind, Some(StreamKind::File));
        assert_eq!(back.chunked, Some(false));
    }
}
