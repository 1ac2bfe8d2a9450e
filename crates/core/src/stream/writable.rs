//! Producer side of the stream protocol.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{StreamBody, StreamDispatcher, StreamKind, StreamStatus};
use crate::channel::Channel;
use crate::conn::Window;
use crate::error::{Error, ErrorCode};
use crate::proto::{Frame, Role, kind, random_id};

/// Default byte span of one file chunk before encoding.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Reply head riding on a `stream_start` that answers a request.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP-style status.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Headers as a JSON object.
    pub headers: Value,
}

/// Everything a stream needs to know about its peer before it can send.
#[derive(Clone)]
pub struct BindContext {
    /// The request this stream answers or accompanies.
    pub request_id: String,
    /// The consuming window.
    pub target: Window,
    /// Origin restriction for sends.
    pub target_origin: String,
    /// Channel used for sending (stamps the secret key).
    pub channel: Channel,
    /// Role of the producing endpoint.
    pub role: Role,
    /// Instance id of the producing endpoint.
    pub creator_id: String,
    /// Addressed endpoint on the consumer window, when known.
    pub target_id: Option<String>,
    /// Where the consumer's control frames for this stream arrive.
    pub streams: Option<StreamDispatcher>,
    /// Reply head for response streams.
    pub head: Option<ResponseHead>,
}

impl Debug for BindContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindContext")
            .field("request_id", &self.request_id)
            .field("target_origin", &self.target_origin)
            .field("target_id", &self.target_id)
            .finish()
    }
}

/// Where the chunks come from.
pub enum ChunkSource {
    /// A degenerate stream with no payload.
    Empty,
    /// Chunks from an iterator.
    Iter(Box<dyn Iterator<Item = crate::Result<Value>> + Send>),
    /// Chunks pulled from a callback until it returns `None`.
    Next(Box<dyn FnMut() -> Option<crate::Result<Value>> + Send>),
}

impl ChunkSource {
    fn next_chunk(&mut self) -> Option<crate::Result<Value>> {
        match self {
            Self::Empty => None,
            Self::Iter(iter) => iter.next(),
            Self::Next(next) => next(),
        }
    }
}

impl Debug for ChunkSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Iter(_) => f.write_str("Iter(..)"),
            Self::Next(_) => f.write_str("Next(..)"),
        }
    }
}

/// Construction options for a [`WritableStream`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// What the stream carries.
    pub kind: StreamKind,
    /// Whether the payload is split into many chunks.
    pub chunked: bool,
    /// Metadata delivered with `stream_start`.
    pub metadata: Option<Value>,
    /// Ask the receiver to materialize the payload before delivery.
    pub auto_resolve: bool,
    /// Stamp `require_ack` on each chunk so the receiver confirms receipt.
    pub chunk_ack: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            kind: StreamKind::Data,
            chunked: true,
            metadata: None,
            auto_resolve: false,
            chunk_ack: false,
        }
    }
}

enum Control {
    Pull(u64),
    Cancel(String),
}

struct WritableState {
    status: StreamStatus,
    source: ChunkSource,
    bind: Option<BindContext>,
    control: Option<mpsc::UnboundedSender<Control>>,
}

struct WritableInner {
    stream_id: String,
    options: StreamOptions,
    state: Mutex<WritableState>,
}

/// Producer side of one stream.
///
/// Life cycle: `pending` until [`start`](WritableStream::start), then
/// `active` while chunks flow, ending in `ended`, `cancelled` or `failed`.
/// Chunks only move on receiver-granted credit unless the stream is
/// non-chunked, in which case the whole payload goes out as one
/// `stream_data` with `done` set.
#[derive(Clone)]
pub struct WritableStream {
    inner: Arc<WritableInner>,
}

impl WritableStream {
    /// New stream over `source`.
    #[must_use]
    pub fn new(source: ChunkSource, options: StreamOptions) -> Self {
        Self {
            inner: Arc::new(WritableInner {
                stream_id: format!("stream-{}", random_id(12)),
                options,
                state: Mutex::new(WritableState {
                    status: StreamStatus::Pending,
                    source,
                    bind: None,
                    control: None,
                }),
            }),
        }
    }

    /// Stream over an iterator of chunks.
    #[must_use]
    pub fn from_iter<I>(chunks: I, options: StreamOptions) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::new(
            ChunkSource::Iter(Box::new(chunks.into_iter().map(Ok))),
            options,
        )
    }

    /// Stream pulling chunks from `next` until it returns `None`.
    #[must_use]
    pub fn from_next(
        next: impl FnMut() -> Option<crate::Result<Value>> + Send + 'static,
        options: StreamOptions,
    ) -> Self {
        Self::new(ChunkSource::Next(Box::new(next)), options)
    }

    /// This stream's id.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Construction options.
    #[must_use]
    pub fn options(&self) -> &StreamOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.inner.state.lock().status
    }

    /// Attach the peer. Must happen before [`start`](Self::start).
    pub fn bind(&self, context: BindContext) {
        self.inner.state.lock().bind = Some(context);
    }

    /// Whether a peer is attached.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.inner.state.lock().bind.is_some()
    }

    /// Negotiate with `stream_start` and drive the source until it is
    /// exhausted, the consumer cancels, the source fails, or the peer
    /// window disappears.
    pub async fn start(&self) -> crate::Result<()> {
        let (bind, control_rx) = self.begin()?;

        // Control frames from the consumer (credit grants and cancels)
        // arrive through the producer endpoint's stream dispatcher.
        if let Some(streams) = &bind.streams {
            let control = self
                .inner
                .state
                .lock()
                .control
                .clone()
                .ok_or_else(|| Error::InvalidState("stream control channel missing".into()))?;
            streams.register(
                self.inner.stream_id.clone(),
                Arc::new(move |frame, body| {
                    let message = match frame.kind.as_str() {
                        kind::STREAM_PULL => Control::Pull(body.credit.unwrap_or(1)),
                        kind::STREAM_CANCEL => Control::Cancel(
                            body.reason.clone().unwrap_or_else(|| "cancelled".into()),
                        ),
                        _ => return,
                    };
                    let _ = control.send(message);
                }),
            );
        }

        let start_body = StreamBody {
            kind: Some(self.inner.options.kind),
            chunked: Some(self.inner.options.chunked),
            metadata: self.inner.options.metadata.clone(),
            auto_resolve: self.inner.options.auto_resolve.then_some(true),
            ..StreamBody::new(self.inner.stream_id.clone())
        };
        if !self.emit(&bind, kind::STREAM_START, start_body, true) {
            return self.bail_unavailable(&bind);
        }

        let result = if self.inner.options.chunked {
            self.run_chunked(&bind, control_rx).await
        } else {
            self.run_single(&bind)
        };
        if let Some(streams) = &bind.streams {
            streams.unregister(&self.inner.stream_id);
        }
        self.inner.state.lock().control = None;
        result
    }

    /// Cancel from the producer side. One-shot; a no-op after the stream
    /// already terminated.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let bind = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = StreamStatus::Cancelled;
            // Wake a running start() so it stops pulling.
            if let Some(control) = &state.control {
                let _ = control.send(Control::Cancel(reason.clone()));
            }
            state.bind.clone()
        };
        if let Some(bind) = bind {
            let body = StreamBody {
                reason: Some(reason),
                ..StreamBody::new(self.inner.stream_id.clone())
            };
            self.emit(&bind, kind::STREAM_CANCEL, body, false);
            if let Some(streams) = &bind.streams {
                streams.unregister(&self.inner.stream_id);
            }
        }
    }

    fn begin(&self) -> crate::Result<(BindContext, mpsc::UnboundedReceiver<Control>)> {
        let mut state = self.inner.state.lock();
        if state.status != StreamStatus::Pending {
            return Err(Error::InvalidState(format!(
                "stream {} already started",
                self.inner.stream_id
            )));
        }
        let bind = state
            .bind
            .clone()
            .ok_or_else(|| Error::InvalidState("stream started before bind".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.control = Some(tx);
        state.status = StreamStatus::Active;
        Ok((bind, rx))
    }

    async fn run_chunked(
        &self,
        bind: &BindContext,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> crate::Result<()> {
        let mut credit: u64 = 0;
        loop {
            while credit == 0 {
                match control_rx.recv().await {
                    Some(Control::Pull(granted)) => credit += granted,
                    Some(Control::Cancel(reason)) => return self.finish_cancelled(reason),
                    None => return self.finish_cancelled("control channel closed".into()),
                }
            }
            while credit > 0 {
                // Late cancels and extra grants may have queued up.
                while let Ok(message) = control_rx.try_recv() {
                    match message {
                        Control::Pull(granted) => credit += granted,
                        Control::Cancel(reason) => return self.finish_cancelled(reason),
                    }
                }
                match self.pull_chunk() {
                    None => return self.finish_ended(bind),
                    Some(Err(error)) => return self.finish_failed(bind, error.to_string()),
                    Some(Ok(chunk)) => {
                        if !Window::is_available(&bind.target) {
                            return self.bail_unavailable(bind);
                        }
                        let body = StreamBody {
                            data: Some(chunk),
                            ..StreamBody::new(self.inner.stream_id.clone())
                        };
                        self.emit(bind, kind::STREAM_DATA, body, false);
                        credit -= 1;
                    }
                }
            }
        }
    }

    fn run_single(&self, bind: &BindContext) -> crate::Result<()> {
        let chunk = match self.pull_chunk() {
            None => Value::Null,
            Some(Ok(chunk)) => chunk,
            Some(Err(error)) => return self.finish_failed(bind, error.to_string()),
        };
        if !Window::is_available(&bind.target) {
            return self.bail_unavailable(bind);
        }
        let body = StreamBody {
            data: Some(chunk),
            done: Some(true),
            ..StreamBody::new(self.inner.stream_id.clone())
        };
        self.emit(bind, kind::STREAM_DATA, body, false);
        self.finish_ended(bind)
    }

    fn pull_chunk(&self) -> Option<crate::Result<Value>> {
        self.inner.state.lock().source.next_chunk()
    }

    fn finish_ended(&self, bind: &BindContext) -> crate::Result<()> {
        self.emit(
            bind,
            kind::STREAM_END,
            StreamBody::new(self.inner.stream_id.clone()),
            false,
        );
        self.inner.state.lock().status = StreamStatus::Ended;
        Ok(())
    }

    fn finish_failed(&self, bind: &BindContext, message: String) -> crate::Result<()> {
        let body = StreamBody {
            message: Some(message.clone()),
            ..StreamBody::new(self.inner.stream_id.clone())
        };
        self.emit(bind, kind::STREAM_ERROR, body, false);
        self.inner.state.lock().status = StreamStatus::Failed;
        Err(Error::Stream {
            stream_id: self.inner.stream_id.clone(),
            message,
        })
    }

    fn finish_cancelled(&self, reason: String) -> crate::Result<()> {
        self.inner.state.lock().status = StreamStatus::Cancelled;
        Err(Error::StreamCancelled {
            stream_id: self.inner.stream_id.clone(),
            reason,
        })
    }

    fn bail_unavailable(&self, _bind: &BindContext) -> crate::Result<()> {
        self.inner.state.lock().status = StreamStatus::Cancelled;
        Err(Error::coded(
            ErrorCode::TargetWindowClosed,
            format!("peer window gone while streaming {}", self.inner.stream_id),
        ))
    }

    fn emit(&self, bind: &BindContext, frame_kind: &str, body: StreamBody, with_head: bool) -> bool {
        let mut frame = Frame::new(frame_kind, bind.request_id.clone())
            .with_role(bind.role)
            .with_creator(bind.creator_id.clone())
            .with_body(body.to_value());
        if let Some(target_id) = &bind.target_id {
            frame = frame.with_target(target_id.clone());
        }
        if frame_kind == kind::STREAM_DATA && self.inner.options.chunk_ack {
            frame = frame.with_require_ack(true);
        }
        if with_head {
            if let Some(head) = &bind.head {
                frame = frame
                    .with_status(head.status, head.status_text.clone())
                    .with_headers(head.headers.clone());
            }
        }
        bind.channel
            .send_message(&bind.target, &bind.target_origin, frame)
    }
}

impl Debug for WritableStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStream")
            .field("stream_id", &self.inner.stream_id)
            .field("status", &self.status())
            .field("options", &self.inner.options)
            .finish()
    }
}
