//! Consumer side of the stream protocol.

use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{CREDIT_LOW_WATER, CREDIT_WINDOW, StreamBody, StreamDispatcher, StreamKind, StreamStatus};
use crate::channel::Channel;
use crate::conn::Window;
use crate::error::Error;
use crate::proto::{Frame, Role, kind};

/// How the consumer talks back to the producer (credit grants, cancels).
#[derive(Clone)]
pub(crate) struct ReplyContext {
    pub(crate) request_id: String,
    pub(crate) target: Window,
    pub(crate) target_origin: String,
    pub(crate) channel: Channel,
    pub(crate) role: Role,
    pub(crate) creator_id: String,
    pub(crate) target_id: Option<String>,
}

impl ReplyContext {
    fn send(&self, frame_kind: &str, body: StreamBody) -> bool {
        let mut frame = Frame::new(frame_kind, self.request_id.clone())
            .with_role(self.role)
            .with_creator(self.creator_id.clone())
            .with_body(body.to_value());
        if let Some(target_id) = &self.target_id {
            frame = frame.with_target(target_id.clone());
        }
        self.channel
            .send_message(&self.target, &self.target_origin, frame)
    }
}

pub(crate) enum StreamItem {
    Chunk(Value),
    End,
    Failed(String),
    Cancelled(String),
}

type EndCallback = Box<dyn FnOnce() + Send>;
type ErrorCallback = Box<dyn FnOnce(&str) + Send>;

struct ReadState {
    status: StreamStatus,
    granted: u64,
    consumed: u64,
    failure: Option<String>,
    on_end: Vec<EndCallback>,
    on_error: Vec<ErrorCallback>,
}

struct ReadableInner {
    stream_id: String,
    request_id: String,
    kind: StreamKind,
    chunked: bool,
    metadata: Option<Value>,
    state: Mutex<ReadState>,
    items: mpsc::UnboundedSender<StreamItem>,
    reply: ReplyContext,
    streams: StreamDispatcher,
}

impl ReadableInner {
    fn grant(&self, credit: u64) {
        self.state.lock().granted += credit;
        let body = StreamBody {
            credit: Some(credit),
            ..StreamBody::new(self.stream_id.clone())
        };
        self.reply.send(kind::STREAM_PULL, body);
    }

    fn on_frame(&self, frame: &Frame, body: &StreamBody) {
        match frame.kind.as_str() {
            kind::STREAM_DATA => {
                let chunk = body.data.clone().unwrap_or(Value::Null);
                let _ = self.items.send(StreamItem::Chunk(chunk));
                if body.done == Some(true) {
                    // Single-frame payloads are complete here even if the
                    // trailing end frame gets lost.
                    let _ = self.items.send(StreamItem::End);
                }
            }
            kind::STREAM_END => {
                self.terminate(StreamStatus::Ended, None);
                let _ = self.items.send(StreamItem::End);
                self.streams.unregister(&self.stream_id);
            }
            kind::STREAM_ERROR => {
                let message = body
                    .message
                    .clone()
                    .unwrap_or_else(|| "stream failed".into());
                self.terminate(StreamStatus::Failed, Some(message.clone()));
                let _ = self.items.send(StreamItem::Failed(message));
                self.streams.unregister(&self.stream_id);
            }
            kind::STREAM_CANCEL => {
                let reason = body.reason.clone().unwrap_or_else(|| "cancelled".into());
                self.terminate(StreamStatus::Cancelled, Some(reason.clone()));
                let _ = self.items.send(StreamItem::Cancelled(reason));
                self.streams.unregister(&self.stream_id);
            }
            _ => {}
        }
    }

    /// Credit is granted against consumption, not arrival: the producer may
    /// stay ahead of the reader by roughly one window, no more.
    fn note_consumed(&self) {
        if !self.chunked {
            return;
        }
        let regrant = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.consumed += 1;
            state.granted.saturating_sub(state.consumed) < CREDIT_LOW_WATER
        };
        if regrant {
            self.grant(CREDIT_WINDOW);
        }
    }

    fn terminate(&self, status: StreamStatus, failure: Option<String>) {
        let (end_callbacks, error_callbacks, message) = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.failure = failure.clone();
            if status == StreamStatus::Ended {
                (std::mem::take(&mut state.on_end), Vec::new(), None)
            } else {
                (Vec::new(), std::mem::take(&mut state.on_error), failure)
            }
        };
        for callback in end_callbacks {
            callback();
        }
        let message = message.unwrap_or_default();
        for callback in error_callbacks {
            callback(&message);
        }
    }
}

/// Consumer side of one stream.
///
/// Chunks buffer as they arrive; they can be drained one by one with
/// [`next_chunk`](ReadableStream::next_chunk) (or `futures` `Stream`
/// iteration), or all at once with [`read`](ReadableStream::read).
pub struct ReadableStream {
    inner: Arc<ReadableInner>,
    items: mpsc::UnboundedReceiver<StreamItem>,
    finished: bool,
}

impl ReadableStream {
    /// Wire a readable stream to the endpoint's stream dispatcher. Called
    /// by the layer that handles `stream_start`.
    pub(crate) fn attach(
        start: &StreamBody,
        request_id: impl Into<String>,
        streams: StreamDispatcher,
        reply: ReplyContext,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let chunked = start.chunked.unwrap_or(true);
        let inner = Arc::new(ReadableInner {
            stream_id: start.stream_id.clone(),
            request_id: request_id.into(),
            kind: start.kind.unwrap_or(StreamKind::Data),
            chunked,
            metadata: start.metadata.clone(),
            state: Mutex::new(ReadState {
                status: StreamStatus::Active,
                granted: 0,
                consumed: 0,
                failure: None,
                on_end: Vec::new(),
                on_error: Vec::new(),
            }),
            items: tx,
            reply,
            streams: streams.clone(),
        });
        let weak: Weak<ReadableInner> = Arc::downgrade(&inner);
        streams.register(
            start.stream_id.clone(),
            Arc::new(move |frame, body| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_frame(frame, body);
                }
            }),
        );
        // A single-frame payload needs no credit dance.
        if chunked {
            inner.grant(CREDIT_WINDOW);
        }
        Self {
            inner,
            items: rx,
            finished: false,
        }
    }

    /// This stream's id.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// The request this stream belongs to.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// What the stream carries.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    /// Whether the payload arrives in many chunks.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.inner.chunked
    }

    /// Producer-supplied metadata from the handshake.
    #[must_use]
    pub fn metadata(&self) -> Option<&Value> {
        self.inner.metadata.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.inner.state.lock().status
    }

    /// Next buffered chunk; `None` once the stream ended. Errors and
    /// cancels surface once, then the stream reads as finished.
    pub async fn next_chunk(&mut self) -> Option<crate::Result<Value>> {
        if self.finished {
            return None;
        }
        match self.items.recv().await {
            Some(StreamItem::Chunk(chunk)) => {
                self.inner.note_consumed();
                Some(Ok(chunk))
            }
            Some(StreamItem::End) | None => {
                self.finished = true;
                None
            }
            Some(StreamItem::Failed(message)) => {
                self.finished = true;
                Some(Err(Error::Stream {
                    stream_id: self.inner.stream_id.clone(),
                    message,
                }))
            }
            Some(StreamItem::Cancelled(reason)) => {
                self.finished = true;
                Some(Err(Error::StreamCancelled {
                    stream_id: self.inner.stream_id.clone(),
                    reason,
                }))
            }
        }
    }

    /// Drain the stream: every chunk in arrival order for a chunked
    /// stream, or the single terminal chunk otherwise.
    pub async fn read(&mut self) -> crate::Result<Vec<Value>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }

    /// Run `callback` when the stream ends normally; immediately when it
    /// already has.
    pub fn on_end(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.status == StreamStatus::Ended {
                true
            } else if state.status.is_terminal() {
                return;
            } else {
                state.on_end.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    /// Run `callback` when the stream fails or is cancelled; immediately
    /// when it already has.
    pub fn on_error(&self, callback: impl FnOnce(&str) + Send + 'static) {
        let message = {
            let mut state = self.inner.state.lock();
            match state.status {
                StreamStatus::Failed | StreamStatus::Cancelled => {
                    state.failure.clone().unwrap_or_default()
                }
                StreamStatus::Ended => return,
                _ => {
                    state.on_error.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&message);
    }

    /// Cancel from the consumer side: tells the producer to stop and
    /// unregisters. A no-op once terminal.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
        }
        let body = StreamBody {
            reason: Some(reason.clone()),
            ..StreamBody::new(self.inner.stream_id.clone())
        };
        self.inner.reply.send(kind::STREAM_CANCEL, body);
        self.inner
            .terminate(StreamStatus::Cancelled, Some(reason.clone()));
        let _ = self.inner.items.send(StreamItem::Cancelled(reason));
        self.inner.streams.unregister(&self.inner.stream_id);
    }
}

impl Stream for ReadableStream {
    type Item = crate::Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.items.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamItem::Chunk(chunk))) => {
                this.inner.note_consumed();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(StreamItem::End) | None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Failed(message))) => {
                this.finished = true;
                Poll::Ready(Some(Err(Error::Stream {
                    stream_id: this.inner.stream_id.clone(),
                    message,
                })))
            }
            Poll::Ready(Some(StreamItem::Cancelled(reason))) => {
                this.finished = true;
                Poll::Ready(Some(Err(Error::StreamCancelled {
                    stream_id: this.inner.stream_id.clone(),
                    reason,
                })))
            }
        }
    }
}

impl Debug for ReadableStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("stream_id", &self.inner.stream_id)
            .field("kind", &self.inner.kind)
            .field("chunked", &self.inner.chunked)
            .field("status", &self.status())
            .finish()
    }
}
