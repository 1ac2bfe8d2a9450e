//! Connectivity probes over the `ping`/`pong` pair.
//!
//! Two operations share the pair. An answering endpoint can `ping_peer` a
//! known window and is satisfied only by a `pong`. A requesting endpoint
//! can probe with `ping_is_connect`, where a bare `ack` already proves a
//! live endpoint claimed the frame, and `pong` is merely the stronger
//! second signal; whichever arrives first wins.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::context::MessageContext;
use crate::conn::Window;
use crate::hub::{Hub, OriginValidator, PENDING_HEARTBEATS, PENDING_IS_CONNECT};
use crate::inbox::{PendingProbe, resolve_probe};
use crate::proto::{Frame, kind, random_id};

/// Install the `ping` responder: any endpoint answers probes addressed to
/// it (or to nobody in particular) with a `pong`.
pub(crate) fn register_ping_responder(hub: &Hub) {
    let handler_hub = hub.clone();
    let options = hub.create_handler_options(None);
    hub.register_handler(
        kind::PING,
        Arc::new(move |frame, context| {
            respond_to_ping(&handler_hub, frame, context);
            Ok(())
        }),
        options,
    );
}

fn respond_to_ping(hub: &Hub, frame: &Frame, context: &MessageContext) {
    if let Some(target_id) = &frame.target_id {
        if target_id != hub.instance_id() {
            return;
        }
    }
    // Accepting lets the dispatcher confirm the claim when the prober
    // asked for an ack.
    context.mark_accepted_by(hub.instance_id());

    let Some(source) = context.source() else {
        tracing::debug!(request_id = %frame.request_id, "ping without source window, no pong");
        return;
    };
    let mut pong = Frame::new(kind::PONG, frame.request_id.clone());
    if let Some(creator_id) = &frame.creator_id {
        pong = pong.with_target(creator_id.clone());
    }
    hub.dispatcher().send(source, pong, context.origin());
}

/// Install the `pong` handler that resolves [`ping_peer`] waiters.
pub(crate) fn register_heartbeat_pong_handler(hub: &Hub) {
    let handler_hub = hub.clone();
    let options = hub.create_handler_options(None);
    hub.register_handler(
        kind::PONG,
        Arc::new(move |frame, context| {
            resolve_probe(&handler_hub, PENDING_HEARTBEATS, frame, context);
            Ok(())
        }),
        options,
    );
}

/// Probe a known peer window; only a `pong` from the expected origin
/// counts. Resolves `false` on timeout.
pub(crate) async fn ping_peer(
    hub: &Hub,
    target: &Window,
    target_origin: &str,
    timeout: Duration,
    target_id: Option<String>,
) -> bool {
    probe(
        hub,
        PENDING_HEARTBEATS,
        target,
        target_origin,
        timeout,
        target_id,
        None,
        None,
    )
    .await
}

/// Requesting-side probe where an `ack` alone already proves connectivity.
/// `on_peer_id` learns the answering endpoint's id.
pub(crate) async fn ping_is_connect(
    hub: &Hub,
    target: &Window,
    target_origin: &str,
    timeout: Duration,
    validator: Option<OriginValidator>,
    on_peer_id: Option<Box<dyn FnOnce(String) + Send>>,
) -> bool {
    probe(
        hub,
        PENDING_IS_CONNECT,
        target,
        target_origin,
        timeout,
        None,
        validator,
        on_peer_id,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn probe(
    hub: &Hub,
    bucket: &'static str,
    target: &Window,
    target_origin: &str,
    timeout: Duration,
    target_id: Option<String>,
    validator: Option<OriginValidator>,
    on_peer_id: Option<Box<dyn FnOnce(String) + Send>>,
) -> bool {
    if !Window::is_available(target) {
        return false;
    }
    let request_id = format!("probe-{}", random_id(12));
    let (resolve, resolved) = oneshot::channel();

    let timer = {
        let timer_hub = hub.clone();
        let request_id = request_id.clone();
        hub.pending().set_timeout(timeout, move || {
            if let Some(probe) = timer_hub
                .pending()
                .remove::<PendingProbe>(bucket, &request_id)
            {
                let _ = probe.resolve.send(false);
            }
        })
    };
    hub.pending().insert(
        bucket,
        &request_id,
        PendingProbe {
            resolve,
            timer,
            target_origin: target_origin.to_owned(),
            validator,
            on_peer_id,
        },
    );

    let mut ping = Frame::new(kind::PING, request_id.clone()).with_require_ack(true);
    if let Some(target_id) = target_id {
        ping = ping.with_target(target_id);
    }
    if !hub.dispatcher().send(target, ping, target_origin) {
        hub.pending().clear_timeout(timer);
        let _ = hub.pending().remove::<PendingProbe>(bucket, &request_id);
        return false;
    }

    resolved.await.unwrap_or(false)
}
