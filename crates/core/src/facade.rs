//! Endpoint composition.
//!
//! A [`Facade`] wires one hub with the pieces its role needs: the inbox and
//! probe machinery for requesting endpoints, the ping responder, ack
//! waiters, and stream routing for both. It owns no policy of its own; it
//! only installs handler sets and lends out the shared parts.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::context::MessageContext;
use crate::conn::Window;
use crate::dispatch::KindMatcher;
use crate::error::{Error, ErrorCode};
use crate::http::IncomingBody;
use crate::hub::{
    Hub, OriginMatcher, OriginValidator, PENDING_ACKS, PENDING_STREAM_STARTS, TimerId,
    validator_from_matcher,
};
use crate::inbox::register_inbox_handlers;
use crate::proto::{Frame, kind};
use crate::stream::{
    FileReadableStream, ReadableStream, ReplyContext, StreamBody, StreamDispatcher, StreamKind,
};

/// How long a request that announced a body stream waits for the
/// handshake before it is abandoned.
pub const DEFAULT_STREAM_START_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a receipt-confirmation waiter survives.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(10);

/// Origin configuration shared by both endpoint flavors.
#[derive(Default)]
pub struct FacadeOptions {
    /// Structural allow-list for peer origins.
    pub allowed_origins: Option<OriginMatcher>,
    /// Full-context validator; wins over `allowed_origins`.
    pub validate_origin: Option<OriginValidator>,
}

impl Debug for FacadeOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeOptions")
            .field("allowed_origins", &self.allowed_origins)
            .field("has_validator", &self.validate_origin.is_some())
            .finish()
    }
}

/// A receipt-confirmation waiter.
struct PendingAck {
    resolve: oneshot::Sender<bool>,
    timer: TimerId,
}

/// A request parked until its announced body stream opens.
struct PendingStreamStart {
    timer: TimerId,
    continue_with: Box<dyn FnOnce(crate::Result<IncomingBody>) + Send>,
}

struct FacadeInner {
    hub: Hub,
    streams: StreamDispatcher,
    origin_validator: Option<OriginValidator>,
}

/// Composition object for one endpoint.
#[derive(Clone)]
pub struct Facade {
    inner: Arc<FacadeInner>,
}

impl Facade {
    /// Wire a facade around `hub`.
    #[must_use]
    pub fn new(hub: Hub, options: FacadeOptions) -> Self {
        let origin_validator = options
            .validate_origin
            .or_else(|| options.allowed_origins.map(validator_from_matcher));
        let streams = StreamDispatcher::new(hub.instance_id().to_owned());
        Self {
            inner: Arc::new(FacadeInner {
                hub,
                streams,
                origin_validator,
            }),
        }
    }

    /// The hub.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// The per-endpoint stream dispatcher.
    #[must_use]
    pub fn streams(&self) -> &StreamDispatcher {
        &self.inner.streams
    }

    /// The compiled origin validator, when one is configured.
    #[must_use]
    pub fn origin_validator(&self) -> Option<&OriginValidator> {
        self.inner.origin_validator.as_ref()
    }

    /// Queue the handler set of an answering endpoint: ping responder,
    /// heartbeat pong waiter, ack waiter, stream handshake and routing.
    pub fn install_server_base_handlers(&self) {
        let facade = self.clone();
        self.inner.hub.on_open(move |hub| {
            crate::heartbeat::register_ping_responder(hub);
            crate::heartbeat::register_heartbeat_pong_handler(hub);
            facade.register_ack_handler(hub);
            facade.register_stream_start_handler(hub);
            facade.register_stream_routing(hub);
        });
    }

    /// Queue the handler set of a requesting endpoint: the inbox, the ack
    /// waiter, the ping responder (a requester still answers probes from
    /// the other side), and stream routing for everything but the
    /// handshake.
    pub fn install_client_handlers(&self) {
        let facade = self.clone();
        self.inner.hub.on_open(move |hub| {
            facade.register_ack_handler(hub);
            register_inbox_handlers(hub, &facade);
            crate::heartbeat::register_ping_responder(hub);
            facade.register_stream_routing(hub);
        });
    }

    /// Probe a known peer window; only `pong` satisfies it.
    pub async fn ping_peer(
        &self,
        target: &Window,
        target_origin: &str,
        timeout: Duration,
        target_id: Option<String>,
    ) -> bool {
        crate::heartbeat::ping_peer(&self.inner.hub, target, target_origin, timeout, target_id)
            .await
    }

    /// Requesting-side connectivity probe; `ack` or `pong` satisfies it.
    pub async fn ping_is_connect(
        &self,
        target: &Window,
        target_origin: &str,
        timeout: Duration,
        on_peer_id: Option<Box<dyn FnOnce(String) + Send>>,
    ) -> bool {
        crate::heartbeat::ping_is_connect(
            &self.inner.hub,
            target,
            target_origin,
            timeout,
            self.inner.origin_validator.clone(),
            on_peer_id,
        )
        .await
    }

    /// Park a waiter that resolves `true` when an `ack` echoing `ack_id`
    /// arrives within `wait`, `false` otherwise.
    pub fn register_pending_ack(&self, ack_id: &str, wait: Duration) -> oneshot::Receiver<bool> {
        let (resolve, resolved) = oneshot::channel();
        let hub = self.inner.hub.clone();
        let timer = {
            let timer_hub = hub.clone();
            let ack_id = ack_id.to_owned();
            hub.pending().set_timeout(wait, move || {
                if let Some(waiter) = timer_hub
                    .pending()
                    .remove::<PendingAck>(PENDING_ACKS, &ack_id)
                {
                    let _ = waiter.resolve.send(false);
                }
            })
        };
        hub.pending()
            .insert(PENDING_ACKS, ack_id, PendingAck { resolve, timer });
        resolved
    }

    /// Park a request whose body arrives as a stream. `continue_with` runs
    /// once the handshake lands (with the wired body) or on timeout (with a
    /// timeout error).
    pub fn register_incoming_stream_start_waiter(
        &self,
        request_id: &str,
        wait: Duration,
        continue_with: impl FnOnce(crate::Result<IncomingBody>) + Send + 'static,
    ) {
        let hub = self.inner.hub.clone();
        let timer = {
            let timer_hub = hub.clone();
            let request_id = request_id.to_owned();
            hub.pending().set_timeout(wait, move || {
                if let Some(waiter) = timer_hub
                    .pending()
                    .remove::<PendingStreamStart>(PENDING_STREAM_STARTS, &request_id)
                {
                    (waiter.continue_with)(Err(Error::coded(
                        ErrorCode::Timeout,
                        format!("body stream for request {request_id} never started"),
                    )));
                }
            })
        };
        hub.pending().insert(
            PENDING_STREAM_STARTS,
            request_id,
            PendingStreamStart {
                timer,
                continue_with: Box::new(continue_with),
            },
        );
    }

    /// Wire the consumer side of a stream announced by `frame`, without
    /// resolving it.
    pub(crate) fn attach_incoming_stream(
        &self,
        frame: &Frame,
        context: &MessageContext,
    ) -> crate::Result<(StreamBody, IncomingBody)> {
        let start = StreamBody::from_frame(frame).ok_or_else(|| {
            Error::InvalidState("stream handshake without a usable body".into())
        })?;
        let source = context.source().cloned().ok_or_else(|| {
            Error::InvalidState("stream handshake without a source window".into())
        })?;
        let reply = ReplyContext {
            request_id: frame.request_id.clone(),
            target: source,
            target_origin: context.origin().to_owned(),
            channel: self.inner.hub.channel().clone(),
            role: self.inner.hub.role(),
            creator_id: self.inner.hub.instance_id().to_owned(),
            target_id: frame.creator_id.clone(),
        };
        let readable = ReadableStream::attach(
            &start,
            frame.request_id.clone(),
            self.inner.streams.clone(),
            reply,
        );
        let body = match start.kind {
            Some(StreamKind::File) => IncomingBody::FileStream(FileReadableStream::new(readable)),
            _ => IncomingBody::Stream(readable),
        };
        Ok((start, body))
    }

    /// Materialize an auto-resolving file stream; other bodies pass
    /// through untouched.
    pub(crate) async fn resolve_incoming_body(
        start: &StreamBody,
        body: IncomingBody,
    ) -> crate::Result<IncomingBody> {
        if start.auto_resolve != Some(true) {
            return Ok(body);
        }
        match body {
            IncomingBody::FileStream(mut stream) => {
                Ok(IncomingBody::File(stream.read_as_file().await?))
            }
            other => Ok(other),
        }
    }

    fn register_ack_handler(&self, hub: &Hub) {
        let handler_hub = hub.clone();
        let mut options = hub.create_handler_options(None);
        // Receipt waiters outrank the inbox so an echo-bound ack is not
        // swallowed as a plain claim notice.
        options.priority = 10;
        hub.register_handler(
            kind::ACK,
            Arc::new(move |frame, context| {
                handle_ack(&handler_hub, frame, context);
                Ok(())
            }),
            options,
        );
    }

    fn register_stream_start_handler(&self, hub: &Hub) {
        let facade = self.clone();
        let options = hub.create_handler_options(None);
        hub.register_handler(
            kind::STREAM_START,
            Arc::new(move |frame, context| {
                facade.handle_stream_start(frame, context);
                Ok(())
            }),
            options,
        );
    }

    fn register_stream_routing(&self, hub: &Hub) {
        let streams = self.inner.streams.clone();
        let options = hub.create_handler_options(None);
        let matcher = KindMatcher::Predicate(Arc::new(|frame_kind| {
            frame_kind.starts_with(kind::STREAM_PREFIX) && frame_kind != kind::STREAM_START
        }));
        hub.register_handler(
            matcher,
            Arc::new(move |frame, context| {
                streams.dispatch(frame, context);
                Ok(())
            }),
            options,
        );
    }

    /// Answering-side handshake: hand the announced body to the request
    /// parked for it.
    pub fn handle_stream_start(&self, frame: &Frame, context: &MessageContext) {
        if let Some(target_id) = &frame.target_id {
            if target_id != self.inner.hub.instance_id() {
                return;
            }
        }
        let hub = &self.inner.hub;
        if !hub
            .pending()
            .contains(PENDING_STREAM_STARTS, &frame.request_id)
        {
            tracing::trace!(request_id = %frame.request_id,
                "stream handshake with no parked request, ignoring");
            return;
        }
        context.mark_accepted_by(hub.instance_id());
        let Some(waiter) = hub
            .pending()
            .remove::<PendingStreamStart>(PENDING_STREAM_STARTS, &frame.request_id)
        else {
            return;
        };
        hub.pending().clear_timeout(waiter.timer);

        match self.attach_incoming_stream(frame, context) {
            Err(error) => (waiter.continue_with)(Err(error)),
            Ok((start, body)) => {
                // Materializing an auto-resolve file means awaiting the
                // chunks, which cannot happen inside the delivery turn.
                tokio::spawn(async move {
                    let resolved = Self::resolve_incoming_body(&start, body).await;
                    (waiter.continue_with)(resolved);
                });
            }
        }
    }

    /// Route one `stream_*` frame through the stream dispatcher.
    pub fn dispatch_stream_message(&self, frame: &Frame, context: &MessageContext) {
        self.inner.streams.dispatch(frame, context);
    }
}

impl Debug for Facade {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facade")
            .field("hub", &self.inner.hub)
            .field("streams", &self.inner.streams)
            .finish()
    }
}

/// Resolve a receipt waiter bound to the echo id on an `ack` frame.
fn handle_ack(hub: &Hub, frame: &Frame, context: &MessageContext) {
    let Some(echo) = &frame.ack else { return };
    let Some(waiter) = hub.pending().remove::<PendingAck>(PENDING_ACKS, &echo.id) else {
        return;
    };
    hub.pending().clear_timeout(waiter.timer);
    context.mark_accepted_by(hub.instance_id());
    let _ = waiter.resolve.send(true);
}

/// Degenerate JSON value for frames that carried nothing.
#[must_use]
pub(crate) fn null_to_none(value: Option<Value>) -> Option<Value> {
    value.filter(|value| !value.is_null())
}
