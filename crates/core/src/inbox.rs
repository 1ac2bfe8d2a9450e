//! Requesting-side pending-request driver.
//!
//! The inbox binds `ack`/`async`/`response`/`error`/`stream_start` frames
//! (and `pong`, for connectivity probes) to the waiter registered under
//! their `request_id`, after checking the waiter's origin expectations.
//! Claim notices and async notices resolve the waiter without removing it,
//! because the caller keeps waiting in a different timeout band; replies
//! and failures remove it.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::MessageContext;
use crate::dispatch::KindMatcher;
use crate::facade::Facade;
use crate::http::IncomingBody;
use crate::hub::{Hub, OriginValidator, PENDING_IS_CONNECT, PENDING_REQUESTS};
use crate::proto::{Frame, MIN_SUPPORTED_VERSION, kind};
use crate::stream::StreamBody;

/// What the send loop learns about its request, in arrival order.
#[derive(Debug)]
pub(crate) enum InboxEvent {
    /// A server claimed the request.
    Ack,
    /// The handler reported asynchronous work.
    Async,
    /// The reply arrives as a stream. The consumer side is already wired
    /// (it must exist before the first chunk lands); only auto-resolve
    /// materialization is left to the waiter.
    StreamStart {
        frame: Box<Frame>,
        start: StreamBody,
        body: IncomingBody,
    },
    /// The reply.
    Response(Box<Frame>),
    /// A failure reply.
    ErrorFrame(Box<Frame>),
    /// Probe answer, for waiters that double as connectivity checks.
    Pong,
    /// The peer speaks an unsupported protocol version.
    ProtocolError(String),
}

/// A waiter for one in-flight request.
pub(crate) struct PendingRequest {
    pub(crate) events: mpsc::UnboundedSender<InboxEvent>,
    /// Origin the reply is expected from; `None` means indifferent.
    pub(crate) origin: Option<String>,
    pub(crate) validator: Option<OriginValidator>,
}

/// A waiter for a connectivity probe (either flavor).
pub(crate) struct PendingProbe {
    pub(crate) resolve: tokio::sync::oneshot::Sender<bool>,
    pub(crate) timer: crate::hub::TimerId,
    pub(crate) target_origin: String,
    pub(crate) validator: Option<OriginValidator>,
    pub(crate) on_peer_id: Option<Box<dyn FnOnce(String) + Send>>,
}

/// Install the requesting-side handler set on `hub`.
pub(crate) fn register_inbox_handlers(hub: &Hub, facade: &Facade) {
    let reply_kinds: KindMatcher = KindMatcher::Predicate(Arc::new(|frame_kind| {
        matches!(
            frame_kind,
            kind::ACK | kind::ASYNC | kind::RESPONSE | kind::ERROR | kind::STREAM_START
        )
    }));

    let on_version_error: crate::dispatch::VersionErrorHook = {
        let hub = hub.clone();
        Arc::new(move |frame: &Frame, _context: &MessageContext, version: u64| {
            let Some(waiter) =
                hub.pending()
                    .remove::<PendingRequest>(PENDING_REQUESTS, &frame.request_id)
            else {
                return;
            };
            let message = format!(
                "peer protocol version {version} is below the supported minimum \
                 {MIN_SUPPORTED_VERSION}"
            );
            let _ = waiter.events.send(InboxEvent::ProtocolError(message));
        })
    };

    {
        let hub = hub.clone();
        let facade = facade.clone();
        let options = hub.create_handler_options(Some(on_version_error));
        hub.clone().register_handler(
            reply_kinds,
            Arc::new(move |frame, context| {
                handle_client_response(&hub, &facade, frame, context);
                Ok(())
            }),
            options,
        );
    }
    {
        let hub = hub.clone();
        let options = hub.create_handler_options(None);
        hub.clone().register_handler(
            kind::PONG,
            Arc::new(move |frame, context| {
                handle_pong(&hub, frame, context);
                Ok(())
            }),
            options,
        );
    }
}

/// Register a waiter for `request_id`.
pub(crate) fn register_pending_request(
    hub: &Hub,
    request_id: &str,
    origin: Option<String>,
    validator: Option<OriginValidator>,
) -> mpsc::UnboundedReceiver<InboxEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    hub.pending().insert(
        PENDING_REQUESTS,
        request_id,
        PendingRequest {
            events: tx,
            origin,
            validator,
        },
    );
    rx
}

/// Drop the waiter for `request_id`, if it still exists.
pub(crate) fn remove_pending_request(hub: &Hub, request_id: &str) {
    let _ = hub
        .pending()
        .remove::<PendingRequest>(PENDING_REQUESTS, request_id);
}

fn handle_client_response(hub: &Hub, facade: &Facade, frame: &Frame, context: &MessageContext) {
    // A probe waiter on this id turns a bare ack into proof of life.
    if frame.kind == kind::ACK && hub.pending().contains(PENDING_IS_CONNECT, &frame.request_id) {
        resolve_probe(hub, PENDING_IS_CONNECT, frame, context);
        return;
    }

    let allowed = hub.pending().with(
        PENDING_REQUESTS,
        &frame.request_id,
        |waiter: &mut PendingRequest| {
            hub.is_origin_allowed_by(
                context.origin(),
                frame,
                context,
                waiter.origin.as_deref(),
                waiter.validator.as_ref(),
            )
        },
    );
    let Some(allowed) = allowed else {
        if !hub.is_open() {
            hub.warn_once(&format!("late:{}", frame.request_id), || {
                tracing::warn!(request_id = %frame.request_id, kind = %frame.kind,
                    "reply arrived after the endpoint closed; dropping");
            });
        }
        return;
    };
    if !allowed {
        // Wrong origin: not our reply. The waiter keeps waiting and times
        // out if nothing legitimate arrives.
        tracing::debug!(request_id = %frame.request_id, origin = %context.origin(),
            "reply origin rejected");
        return;
    }

    context.mark_accepted_by(hub.instance_id());

    let event = match frame.kind.as_str() {
        kind::ACK => InboxEvent::Ack,
        kind::ASYNC => InboxEvent::Async,
        kind::STREAM_START => {
            // The consumer side must exist before the next delivery turn;
            // a back-to-back chunk would otherwise fall on the floor.
            match facade.attach_incoming_stream(frame, context) {
                Ok((start, body)) => InboxEvent::StreamStart {
                    frame: Box::new(frame.clone()),
                    start,
                    body,
                },
                Err(error) => {
                    tracing::error!(%error, request_id = %frame.request_id,
                        "could not wire incoming reply stream");
                    return;
                }
            }
        }
        kind::RESPONSE => InboxEvent::Response(Box::new(frame.clone())),
        kind::ERROR => InboxEvent::ErrorFrame(Box::new(frame.clone())),
        _ => return,
    };

    // Replies and failures finish the exchange; everything else keeps the
    // waiter alive for its next timeout band.
    if matches!(frame.kind.as_str(), kind::RESPONSE | kind::ERROR) {
        if let Some(waiter) = hub
            .pending()
            .remove::<PendingRequest>(PENDING_REQUESTS, &frame.request_id)
        {
            let _ = waiter.events.send(event);
        }
    } else {
        hub.pending().with(
            PENDING_REQUESTS,
            &frame.request_id,
            |waiter: &mut PendingRequest| {
                let _ = waiter.events.send(event);
            },
        );
    }
}

fn handle_pong(hub: &Hub, frame: &Frame, context: &MessageContext) {
    if hub.pending().contains(PENDING_IS_CONNECT, &frame.request_id) {
        resolve_probe(hub, PENDING_IS_CONNECT, frame, context);
        return;
    }
    // A pong can also answer a plain waiter; it finishes the exchange.
    let allowed = hub.pending().with(
        PENDING_REQUESTS,
        &frame.request_id,
        |waiter: &mut PendingRequest| {
            hub.is_origin_allowed_by(
                context.origin(),
                frame,
                context,
                waiter.origin.as_deref(),
                waiter.validator.as_ref(),
            )
        },
    );
    if allowed == Some(true) {
        context.mark_accepted_by(hub.instance_id());
        if let Some(waiter) = hub
            .pending()
            .remove::<PendingRequest>(PENDING_REQUESTS, &frame.request_id)
        {
            let _ = waiter.events.send(InboxEvent::Pong);
        }
    }
}

/// Resolve a probe waiter, strictly checking the origin it was aimed at.
/// A mismatched frame is still marked accepted (the fabric claimed it) but
/// does not count as proof of connectivity.
pub(crate) fn resolve_probe(hub: &Hub, bucket: &str, frame: &Frame, context: &MessageContext) {
    let allowed = hub
        .pending()
        .with(bucket, &frame.request_id, |probe: &mut PendingProbe| {
            // Both gates must hold: the probe was aimed at one origin, and
            // any configured validator still gets its say.
            let origin_ok = probe.target_origin == "*"
                || probe.target_origin == context.origin();
            origin_ok
                && probe
                    .validator
                    .as_ref()
                    .is_none_or(|validator| validator(context.origin(), frame, context))
        });
    match allowed {
        None => {}
        Some(false) => {
            context.mark_accepted_by(hub.instance_id());
            tracing::debug!(request_id = %frame.request_id, origin = %context.origin(),
                "probe answer from unexpected origin ignored");
        }
        Some(true) => {
            context.mark_accepted_by(hub.instance_id());
            if let Some(probe) = hub
                .pending()
                .remove::<PendingProbe>(bucket, &frame.request_id)
            {
                hub.pending().clear_timeout(probe.timer);
                if let (Some(on_peer_id), Some(creator_id)) =
                    (probe.on_peer_id, frame.creator_id.clone())
                {
                    on_peer_id(creator_id);
                }
                let _ = probe.resolve.send(true);
            }
        }
    }
}
