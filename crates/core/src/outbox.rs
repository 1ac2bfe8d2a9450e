//! Peer-bound sender.
//!
//! An [`Outbox`] is created per peer (and, on the answering side, per
//! request) from a hub. It stamps addressing onto outgoing frames and owns
//! the body-type dispatch: plain values go inline, files and blobs are
//! adapted to file streams, prepared streams are bound and started. When a
//! request carries a stream body, the request frame is emitted first and
//! the stream starts fire-and-forget so the caller is already waiting for
//! the reply while its body flows.

use std::fmt::{self, Debug, Formatter};

use parking_lot::Mutex;
use serde_json::Value;

use crate::conn::Window;
use crate::http::OutgoingBody;
use crate::hub::Hub;
use crate::proto::{AckEcho, ErrorPayload, Frame, kind};
use crate::stream::{
    BindContext, FileContent, FileStreamOptions, FileWritableStream, ResponseHead,
    StreamDispatcher, WritableStream,
};

/// Fields of an outgoing request.
#[derive(Debug)]
pub struct RequestParts {
    /// Correlation id.
    pub request_id: String,
    /// Route path, already namespaced for the channel key.
    pub path: String,
    /// Request body.
    pub body: OutgoingBody,
    /// Headers as a JSON object.
    pub headers: Option<Value>,
    /// Cookies as a JSON object.
    pub cookies: Option<Value>,
    /// Ask the server to confirm the claim with an extra ack echo.
    pub ack: Option<AckEcho>,
    /// Address one specific server endpoint.
    pub target_id: Option<String>,
}

/// Fields of an outgoing reply.
#[derive(Debug)]
pub struct ResponseParts {
    /// Correlation id of the request being answered.
    pub request_id: String,
    /// HTTP-style status.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Inline payload.
    pub data: Option<Value>,
    /// Headers as a JSON object.
    pub headers: Option<Value>,
    /// Ask the requester to confirm receipt.
    pub require_ack: bool,
    /// Echo binding for that confirmation.
    pub ack: Option<AckEcho>,
}

struct OutboxInner {
    hub: Hub,
    target: Window,
    target_origin: String,
    default_target_id: Mutex<Option<String>>,
}

/// A sender bound to one peer window.
#[derive(Clone)]
pub struct Outbox {
    inner: std::sync::Arc<OutboxInner>,
}

impl Outbox {
    pub(crate) fn new(
        hub: Hub,
        target: Window,
        target_origin: String,
        default_target_id: Option<String>,
    ) -> Self {
        Self {
            inner: std::sync::Arc::new(OutboxInner {
                hub,
                target,
                target_origin,
                default_target_id: Mutex::new(default_target_id),
            }),
        }
    }

    /// The peer window.
    #[must_use]
    pub fn target(&self) -> &Window {
        &self.inner.target
    }

    /// The origin restriction applied to sends.
    #[must_use]
    pub fn target_origin(&self) -> &str {
        &self.inner.target_origin
    }

    /// Endpoint id stamped as `target_id` on frames that omit it.
    pub fn set_default_target_id(&self, target_id: Option<String>) {
        *self.inner.default_target_id.lock() = target_id;
    }

    /// Whether the peer window can still receive.
    #[must_use]
    pub fn is_peer_available(&self) -> bool {
        Window::is_available(&self.inner.target)
    }

    /// Emit a frame, stamping the default target id, role and creator.
    pub fn send_frame(&self, mut frame: Frame) -> bool {
        if frame.target_id.is_none() {
            frame.target_id = self.inner.default_target_id.lock().clone();
        }
        self.inner
            .hub
            .dispatcher()
            .send(&self.inner.target, frame, &self.inner.target_origin)
    }

    /// Emit a request. Stream bodies are negotiated after the request frame
    /// is on the wire, without waiting for the stream to drain.
    pub fn send_request(&self, parts: RequestParts, streams: &StreamDispatcher) -> bool {
        let RequestParts {
            request_id,
            path,
            body,
            headers,
            cookies,
            ack,
            target_id,
        } = parts;
        let mut frame = Frame::new(kind::REQUEST, request_id.clone())
            .with_path(path)
            .with_require_ack(true);
        if let Some(headers) = headers {
            frame = frame.with_headers(headers);
        }
        if let Some(cookies) = cookies {
            frame = frame.with_cookies(cookies);
        }
        if let Some(ack) = ack {
            frame = frame.with_ack(ack);
        }
        if let Some(target_id) = target_id {
            frame = frame.with_target(target_id);
        }

        match body {
            OutgoingBody::Empty => self.send_frame(frame),
            OutgoingBody::Json(value) => self.send_frame(frame.with_body(value)),
            OutgoingBody::File(file) => {
                let stream =
                    FileWritableStream::new(FileContent::File(file), FileStreamOptions::default());
                self.launch_request_stream(frame, stream.stream().clone(), streams)
            }
            OutgoingBody::Blob(blob) => {
                let stream =
                    FileWritableStream::new(FileContent::Blob(blob), FileStreamOptions::default());
                self.launch_request_stream(frame, stream.stream().clone(), streams)
            }
            OutgoingBody::FileStream(stream) => {
                self.launch_request_stream(frame, stream.stream().clone(), streams)
            }
            OutgoingBody::Stream(stream) => self.launch_request_stream(frame, stream, streams),
        }
    }

    /// Emit an `async` notice for a request whose handler went async.
    pub fn send_async(&self, request_id: &str) -> bool {
        self.send_frame(Frame::new(kind::ASYNC, request_id.to_owned()))
    }

    /// Emit an advisory claim confirmation. The ack itself is never
    /// re-confirmed.
    pub fn send_ack(&self, request_id: &str) -> bool {
        self.send_frame(Frame::new(kind::ACK, request_id.to_owned()).with_require_ack(false))
    }

    /// Emit a plain reply.
    pub fn send_response(&self, parts: ResponseParts) -> bool {
        let ResponseParts {
            request_id,
            status,
            status_text,
            data,
            headers,
            require_ack,
            ack,
        } = parts;
        let mut frame =
            Frame::new(kind::RESPONSE, request_id).with_status(status, status_text);
        if let Some(data) = data {
            frame = frame.with_data(data);
        }
        if let Some(headers) = headers {
            frame = frame.with_headers(headers);
        }
        if require_ack {
            frame = frame.with_require_ack(true);
            if let Some(ack) = ack {
                frame = frame.with_ack(ack);
            }
        }
        self.send_frame(frame)
    }

    /// Emit a failure reply.
    pub fn send_error(
        &self,
        request_id: &str,
        status: u16,
        status_text: &str,
        code: &str,
        message: &str,
    ) -> bool {
        let frame = Frame::new(kind::ERROR, request_id.to_owned())
            .with_status(status, status_text.to_owned())
            .with_error(ErrorPayload {
                code: Some(code.to_owned()),
                message: Some(message.to_owned()),
            });
        self.send_frame(frame)
    }

    /// Adapt `content` to a file stream answering `request_id` and start it
    /// without blocking the caller.
    pub fn send_file(
        &self,
        request_id: &str,
        content: impl Into<FileContent>,
        options: FileStreamOptions,
        head: Option<ResponseHead>,
        streams: &StreamDispatcher,
    ) -> FileWritableStream {
        let stream = FileWritableStream::new(content, options);
        self.start_stream(stream.stream().clone(), request_id, head, streams, false);
        stream
    }

    /// Bind `stream` to this peer for `request_id` and start it.
    ///
    /// With `await_start` the call resolves when the stream finishes;
    /// otherwise the stream is driven in the background.
    pub async fn send_stream(
        &self,
        stream: WritableStream,
        request_id: &str,
        head: Option<ResponseHead>,
        streams: &StreamDispatcher,
        await_start: bool,
    ) -> crate::Result<()> {
        if await_start {
            stream.bind(self.make_bind_context(request_id, head, streams));
            stream.start().await
        } else {
            self.start_stream(stream, request_id, head, streams, false);
            Ok(())
        }
    }

    /// The bind context a stream needs to reach this peer.
    #[must_use]
    pub fn make_bind_context(
        &self,
        request_id: &str,
        head: Option<ResponseHead>,
        streams: &StreamDispatcher,
    ) -> BindContext {
        BindContext {
            request_id: request_id.to_owned(),
            target: self.inner.target.clone(),
            target_origin: self.inner.target_origin.clone(),
            channel: self.inner.hub.channel().clone(),
            role: self.inner.hub.role(),
            creator_id: self.inner.hub.instance_id().to_owned(),
            target_id: self.inner.default_target_id.lock().clone(),
            streams: Some(streams.clone()),
            head,
        }
    }

    fn launch_request_stream(
        &self,
        frame: Frame,
        stream: WritableStream,
        streams: &StreamDispatcher,
    ) -> bool {
        let frame = frame.with_stream_id(stream.stream_id().to_owned());
        let request_id = frame.request_id.clone();
        // The request goes out first so the server can park a waiter for
        // the handshake; only then does the body stream open.
        if !self.send_frame(frame) {
            return false;
        }
        self.start_stream(stream, &request_id, None, streams, false);
        true
    }

    fn start_stream(
        &self,
        stream: WritableStream,
        request_id: &str,
        head: Option<ResponseHead>,
        streams: &StreamDispatcher,
        log_errors_quietly: bool,
    ) {
        stream.bind(self.make_bind_context(request_id, head, streams));
        tokio::spawn(async move {
            if let Err(error) = stream.start().await {
                if log_errors_quietly {
                    tracing::debug!(%error, "stream finished with error");
                } else {
                    tracing::warn!(%error, "stream finished with error");
                }
            }
        });
    }
}

impl Debug for Outbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("target", &self.inner.target.id())
            .field("target_origin", &self.inner.target_origin)
            .field("default_target_id", &self.inner.default_target_id.lock())
            .finish()
    }
}
