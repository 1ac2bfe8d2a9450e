//! The policy layer between a channel and per-kind frame handlers.
//!
//! One dispatcher exists per endpoint. It attaches to the shared channel as
//! a single receiver and walks its handler table for every delivery,
//! enforcing the cooperative claim between co-resident endpoints, the
//! same-role drop, per-handler protocol-version validation, and the
//! generalized auto-ack that answers any claimed frame whose sender asked
//! for a receipt.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use regex::Regex;

use crate::channel::{Channel, ReceiverId};
use crate::conn::Window;
use crate::context::MessageContext;
use crate::proto::{Frame, Role, kind};

/// How a handler selects the frame kinds it wants.
#[derive(Clone)]
pub enum KindMatcher {
    /// Exact kind string.
    Exact(String),
    /// Regular expression over the kind.
    Pattern(Regex),
    /// Arbitrary predicate over the kind.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl KindMatcher {
    /// Whether `kind` is selected.
    #[must_use]
    pub fn matches(&self, kind: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == kind,
            Self::Pattern(pattern) => pattern.is_match(kind),
            Self::Predicate(predicate) => predicate(kind),
        }
    }
}

impl From<&str> for KindMatcher {
    fn from(kind: &str) -> Self {
        Self::Exact(kind.to_owned())
    }
}
impl From<String> for KindMatcher {
    fn from(kind: String) -> Self {
        Self::Exact(kind)
    }
}
impl From<Regex> for KindMatcher {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}

impl Debug for KindMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(kind) => write!(f, "Exact({kind})"),
            Self::Pattern(pattern) => write!(f, "Pattern({pattern})"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A registered frame handler.
pub type FrameHandler = Arc<dyn Fn(&Frame, &MessageContext) -> crate::Result<()> + Send + Sync>;
/// Per-handler protocol-version gate.
pub type VersionValidator = Arc<dyn Fn(u64) -> bool + Send + Sync>;
/// Invoked instead of the handler when its version gate rejects a frame.
pub type VersionErrorHook = Arc<dyn Fn(&Frame, &MessageContext, u64) + Send + Sync>;

/// Registration options for a handler.
#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Handlers run highest priority first; ties keep registration order.
    pub priority: i32,
    /// Version gate; when absent every version is let through.
    pub version_validator: Option<VersionValidator>,
    /// Hook for frames the version gate rejected.
    pub on_version_error: Option<VersionErrorHook>,
}

impl Debug for HandlerOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOptions")
            .field("priority", &self.priority)
            .field("has_version_validator", &self.version_validator.is_some())
            .finish()
    }
}

/// Token for unregistering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: u64,
    matcher: KindMatcher,
    handler: FrameHandler,
    options: HandlerOptions,
    seq: u64,
}

struct DispatcherInner {
    role: Role,
    instance_id: String,
    channel: Channel,
    entries: Mutex<Vec<HandlerEntry>>,
    next_id: AtomicU64,
    fallback: Mutex<Option<(Window, String)>>,
    receiver: Mutex<Option<ReceiverId>>,
}

/// Fans channel deliveries across an endpoint's handlers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher for `role`/`instance_id` and attach it to the
    /// channel as one receiver.
    #[must_use]
    pub fn new(role: Role, instance_id: impl Into<String>, channel: Channel) -> Self {
        let inner = Arc::new(DispatcherInner {
            role,
            instance_id: instance_id.into(),
            channel: channel.clone(),
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fallback: Mutex::new(None),
            receiver: Mutex::new(None),
        });
        let weak: Weak<DispatcherInner> = Arc::downgrade(&inner);
        let receiver = channel.add_receiver(Arc::new(move |frame, context| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.dispatch(frame, context);
            }
            Ok(())
        }));
        *inner.receiver.lock() = Some(receiver);
        Self { inner }
    }

    /// This dispatcher's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The owning endpoint's instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// The underlying channel.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Reply target used by auto-ack when a delivery carries no source
    /// window.
    pub fn set_fallback_target(&self, window: Window, origin: impl Into<String>) {
        *self.inner.fallback.lock() = Some((window, origin.into()));
    }

    /// Register a handler; returns a token for
    /// [`unregister_handler`](Self::unregister_handler).
    pub fn register_handler(
        &self,
        matcher: impl Into<KindMatcher>,
        handler: FrameHandler,
        options: HandlerOptions,
    ) -> HandlerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.inner.entries.lock();
        entries.push(HandlerEntry {
            id,
            matcher: matcher.into(),
            handler,
            options,
            seq: id,
        });
        // Stable sort: equal priorities stay in registration order.
        entries.sort_by_key(|entry| (std::cmp::Reverse(entry.options.priority), entry.seq));
        HandlerId(id)
    }

    /// Remove a handler by its token.
    pub fn unregister_handler(&self, id: HandlerId) {
        self.inner.entries.lock().retain(|entry| entry.id != id.0);
    }

    /// Detach from the channel. Called on hub destruction.
    pub(crate) fn detach(&self) {
        if let Some(receiver) = self.inner.receiver.lock().take() {
            self.inner.channel.remove_receiver(receiver);
        }
    }

    /// Emit a frame, stamping this endpoint's role and id when absent.
    pub fn send(&self, target: &Window, mut frame: Frame, target_origin: &str) -> bool {
        if frame.role.is_none() {
            frame.role = Some(self.inner.role);
        }
        if frame.creator_id.is_none() {
            frame.creator_id = Some(self.inner.instance_id.clone());
        }
        self.inner.channel.send_message(target, target_origin, frame)
    }

    /// Run one delivery through the handler table.
    pub fn dispatch(&self, frame: &Frame, context: &MessageContext) {
        // Another endpoint on this channel already claimed the frame.
        if context.handled_by().is_some() {
            return;
        }
        // A frame from our own role is an echo of our side of the fabric.
        if frame.role == Some(self.inner.role) {
            return;
        }

        let entries: Vec<(KindMatcher, FrameHandler, HandlerOptions)> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|entry| {
                (
                    entry.matcher.clone(),
                    Arc::clone(&entry.handler),
                    entry.options.clone(),
                )
            })
            .collect();

        let mut first = true;
        for (matcher, handler, options) in entries {
            if !matcher.matches(&frame.kind) {
                continue;
            }
            if let Some(validator) = &options.version_validator {
                if !validator(frame.version) {
                    if let Some(hook) = &options.on_version_error {
                        hook(frame, context, frame.version);
                    } else {
                        tracing::warn!(version = frame.version, kind = %frame.kind,
                            "dropping frame with unsupported protocol version");
                    }
                    continue;
                }
            }
            // A previous handler claimed the frame; the rest stand down.
            if !first && context.handled_by().is_some() {
                break;
            }
            first = false;
            if let Err(error) = handler(frame, context) {
                tracing::error!(%error, kind = %frame.kind, request_id = %frame.request_id,
                    "frame handler failed; continuing with remaining handlers");
            }
            self.maybe_auto_ack(frame, context);
        }
        self.maybe_auto_ack(frame, context);

        if let Some(owner) = context.handled_by() {
            context.mark_done_by(&owner);
        }
    }

    /// Answer a claimed `require_ack` frame with a single size-bounded ack.
    fn maybe_auto_ack(&self, frame: &Frame, context: &MessageContext) {
        if !frame.wants_ack() || frame.kind == kind::ACK {
            return;
        }
        if context.accepted_by().is_none() {
            return;
        }
        let fallback = self.inner.fallback.lock().clone();
        let (target, target_origin) = match context.source() {
            Some(source) => (source.clone(), context.origin().to_owned()),
            None => match fallback {
                Some((window, origin)) => (window, origin),
                None => return,
            },
        };
        if !context.mark_ack_sent() {
            return;
        }
        let mut ack = Frame::new(kind::ACK, frame.request_id.clone());
        if let Some(creator) = &frame.creator_id {
            ack = ack.with_target(creator.clone());
        }
        if let Some(echo) = frame.ack.as_ref().and_then(crate::proto::AckEcho::bounded) {
            ack = ack.with_ack(echo);
        }
        self.send(&target, ack, &target_origin);
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("role", &self.inner.role)
            .field("instance_id", &self.inner.instance_id)
            .field("handlers", &self.inner.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{AckEcho, MAX_ACK_META_LEN, MIN_SUPPORTED_VERSION};
    use serde_json::Value;
    use tokio::time::{Duration, sleep};

    fn make(role: Role, id: &str) -> Dispatcher {
        let window = Window::new("https://app.test");
        Dispatcher::new(role, id, Channel::new(window, None))
    }

    fn record_into(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> FrameHandler {
        let log = Arc::clone(log);
        let tag = tag.to_owned();
        Arc::new(move |_, _| {
            log.lock().push(tag.clone());
            Ok(())
        })
    }

    #[tokio::test]
    async fn priority_orders_handlers_and_ties_keep_registration_order() {
        let dispatcher = make(Role::Server, "s1");
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.register_handler("request", record_into(&log, "low"), HandlerOptions {
            priority: -1,
            ..Default::default()
        });
        dispatcher.register_handler("request", record_into(&log, "first"), HandlerOptions::default());
        dispatcher.register_handler("request", record_into(&log, "second"), HandlerOptions::default());
        dispatcher.register_handler("request", record_into(&log, "high"), HandlerOptions {
            priority: 5,
            ..Default::default()
        });

        let frame = Frame::new(kind::REQUEST, "r1").with_role(Role::Client);
        dispatcher.dispatch(&frame, &MessageContext::new("https://peer.test", None));
        assert_eq!(*log.lock(), vec!["high", "first", "second", "low"]);
    }

    #[tokio::test]
    async fn same_role_frames_are_dropped() {
        let dispatcher = make(Role::Client, "c1");
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register_handler("ack", record_into(&log, "hit"), HandlerOptions::default());

        let from_client = Frame::new(kind::ACK, "r1").with_role(Role::Client);
        dispatcher.dispatch(&from_client, &MessageContext::new("https://peer.test", None));
        assert!(log.lock().is_empty());

        let from_server = Frame::new(kind::ACK, "r1").with_role(Role::Server);
        dispatcher.dispatch(&from_server, &MessageContext::new("https://peer.test", None));
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn claimed_context_short_circuits() {
        let dispatcher = make(Role::Server, "s2");
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register_handler("request", record_into(&log, "hit"), HandlerOptions::default());

        let context = MessageContext::new("https://peer.test", None);
        context.mark_handled_by("other-endpoint");
        let frame = Frame::new(kind::REQUEST, "r1").with_role(Role::Client);
        dispatcher.dispatch(&frame, &context);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn claim_by_one_handler_stops_later_ones() {
        let dispatcher = make(Role::Server, "s3");
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            dispatcher.register_handler(
                "request",
                Arc::new(move |_, context: &MessageContext| {
                    context.mark_handled_by("s3");
                    log.lock().push("claimer".into());
                    Ok(())
                }),
                HandlerOptions::default(),
            );
        }
        dispatcher.register_handler("request", record_into(&log, "late"), HandlerOptions::default());

        let frame = Frame::new(kind::REQUEST, "r1").with_role(Role::Client);
        let context = MessageContext::new("https://peer.test", None);
        dispatcher.dispatch(&frame, &context);
        assert_eq!(*log.lock(), vec!["claimer"]);
        // The claim is also finished off.
        assert_eq!(context.done_by().as_deref(), Some("s3"));
    }

    #[tokio::test]
    async fn version_gate_routes_to_hook_and_spares_other_handlers() {
        let dispatcher = make(Role::Client, "c2");
        let log = Arc::new(Mutex::new(Vec::new()));
        let versions = Arc::new(Mutex::new(Vec::new()));
        {
            let versions = Arc::clone(&versions);
            dispatcher.register_handler(
                "response",
                record_into(&log, "gated"),
                HandlerOptions {
                    version_validator: Some(Arc::new(|v| v >= MIN_SUPPORTED_VERSION)),
                    on_version_error: Some(Arc::new(move |_, _, version| {
                        versions.lock().push(version);
                    })),
                    ..Default::default()
                },
            );
        }
        dispatcher.register_handler("response", record_into(&log, "open"), HandlerOptions::default());

        let mut frame = Frame::new(kind::RESPONSE, "r1").with_role(Role::Server);
        frame.version = 0;
        dispatcher.dispatch(&frame, &MessageContext::new("https://peer.test", None));

        assert_eq!(*log.lock(), vec!["open"]);
        assert_eq!(*versions.lock(), vec![0]);
    }

    #[tokio::test]
    async fn auto_ack_echoes_bounded_ack_once() {
        let server_window = Window::new("https://server.test");
        let client_window = Window::new("https://client.test");
        let dispatcher = Dispatcher::new(
            Role::Server,
            "s1",
            Channel::new(server_window.clone(), None),
        );

        // Watch the client window for the ack reply.
        let acks = Arc::new(Mutex::new(Vec::<Value>::new()));
        {
            let acks = Arc::clone(&acks);
            client_window.add_listener(move |event| {
                acks.lock().push(event.data.clone());
            });
        }

        dispatcher.register_handler(
            "ping",
            Arc::new(|_, context: &MessageContext| {
                context.mark_accepted_by("s1");
                Ok(())
            }),
            HandlerOptions::default(),
        );

        let frame = Frame::new(kind::PING, "p1")
            .with_role(Role::Client)
            .with_creator("c1")
            .with_require_ack(true)
            .with_ack(AckEcho {
                id: "echo-1".into(),
                meta: Some("m".repeat(MAX_ACK_META_LEN + 1)),
            });
        let context = MessageContext::new(
            "https://client.test",
            Some(client_window.clone()),
        );
        dispatcher.dispatch(&frame, &context);
        sleep(Duration::from_millis(20)).await;

        let acks = acks.lock();
        assert_eq!(acks.len(), 1, "exactly one ack for one delivery");
        let ack = &acks[0];
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["requestId"], "p1");
        assert_eq!(ack["targetId"], "c1");
        assert_eq!(ack["creatorId"], "s1");
        assert_eq!(ack["role"], "server");
        assert_eq!(ack["ack"]["id"], "echo-1");
        // Oversized meta was stripped from the echo.
        assert!(ack["ack"].get("meta").is_none());
    }

    #[tokio::test]
    async fn no_ack_without_acceptance_or_without_request() {
        let server_window = Window::new("https://server.test");
        let client_window = Window::new("https://client.test");
        let dispatcher = Dispatcher::new(
            Role::Server,
            "s1",
            Channel::new(server_window.clone(), None),
        );
        let acks = Arc::new(Mutex::new(0usize));
        {
            let acks = Arc::clone(&acks);
            client_window.add_listener(move |_| {
                *acks.lock() += 1;
            });
        }
        // Handler that only claims but never accepts.
        dispatcher.register_handler(
            "ping",
            Arc::new(|_, context: &MessageContext| {
                context.mark_handled_by("s1");
                Ok(())
            }),
            HandlerOptions::default(),
        );

        let wants_ack = Frame::new(kind::PING, "p1")
            .with_role(Role::Client)
            .with_require_ack(true);
        let context = MessageContext::new("https://client.test", Some(client_window.clone()));
        dispatcher.dispatch(&wants_ack, &context);

        // Accepted, but the sender never asked for an ack.
        let no_ack_wanted = Frame::new(kind::PING, "p2").with_role(Role::Client);
        let context = MessageContext::new("https://client.test", Some(client_window.clone()));
        context.mark_accepted_by("s1");
        dispatcher.dispatch(&no_ack_wanted, &context);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(*acks.lock(), 0);
    }
}
