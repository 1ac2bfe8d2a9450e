//! The per-endpoint hub: one dispatcher, the pending bookkeeping, and the
//! policies every handler of the endpoint shares.

mod origin;
mod pending;

pub use origin::{OriginMatcher, OriginValidator, is_origin_allowed, validator_from_matcher};
pub use pending::{Limiter, PendingManager, TimerId};

pub(crate) use pending::{
    PENDING_ACKS, PENDING_HEARTBEATS, PENDING_IS_CONNECT, PENDING_REQUESTS, PENDING_STREAM_STARTS,
};

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{self, Channel};
use crate::conn::Window;
use crate::context::MessageContext;
use crate::dispatch::{
    Dispatcher, FrameHandler, HandlerId, HandlerOptions, KindMatcher, VersionErrorHook,
    VersionValidator,
};
use crate::outbox::Outbox;
use crate::proto::{Frame, MIN_SUPPORTED_VERSION, Role, random_id};

/// Construction options for a [`Hub`].
#[derive(Default)]
pub struct HubOptions {
    /// Channel-isolation tag shared by both peers.
    pub secret_key: Option<String>,
    /// Explicit endpoint id; a random one is generated when absent.
    pub instance_id: Option<String>,
    /// Lowest peer protocol version this endpoint accepts.
    pub min_version: Option<u64>,
}

impl Debug for HubOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubOptions")
            .field("secret_key", &self.secret_key)
            .field("instance_id", &self.instance_id)
            .field("min_version", &self.min_version)
            .finish()
    }
}

#[derive(Default)]
struct HubState {
    opened: bool,
    destroyed: bool,
}

type OpenHook = Arc<dyn Fn(&Hub) + Send + Sync>;

struct HubInner {
    instance_id: String,
    role: Role,
    channel: Channel,
    dispatcher: Dispatcher,
    pending: PendingManager,
    limiter: Limiter,
    warned: Mutex<HashSet<String>>,
    state: Mutex<HubState>,
    registrations: Mutex<Vec<HandlerId>>,
    open_hooks: Mutex<Vec<OpenHook>>,
    version_validator: VersionValidator,
}

/// Owner of one endpoint's dispatcher, pending state and policies.
///
/// Lifecycle: [`open`](Hub::open) installs the handler set (idempotent),
/// [`close`](Hub::close) removes it but deliberately keeps pending waiters
/// alive so legitimate late frames can still resolve them, and
/// [`destroy`](Hub::destroy) additionally clears all pending state and gives
/// the shared channel reference back.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub for `role` listening on `window`, joining the shared
    /// channel for the configured `secret_key`.
    #[must_use]
    pub fn new(window: &Window, role: Role, options: HubOptions) -> Self {
        let instance_id = options
            .instance_id
            .unwrap_or_else(|| format!("{}-{}", role_tag(role), random_id(12)));
        let channel = channel::acquire(window, options.secret_key);
        let dispatcher = Dispatcher::new(role, instance_id.clone(), channel.clone());
        let min_version = options.min_version.unwrap_or(MIN_SUPPORTED_VERSION);
        Self {
            inner: Arc::new(HubInner {
                instance_id,
                role,
                channel,
                dispatcher,
                pending: PendingManager::new(),
                limiter: Limiter::new(),
                warned: Mutex::new(HashSet::new()),
                state: Mutex::new(HubState::default()),
                registrations: Mutex::new(Vec::new()),
                open_hooks: Mutex::new(Vec::new()),
                version_validator: Arc::new(move |version| version >= min_version),
            }),
        }
    }

    /// This endpoint's id; travels as `creator_id` on every frame it sends.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// This endpoint's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The shared channel.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// The dispatcher owned by this hub.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Pending-operation bookkeeping.
    #[must_use]
    pub fn pending(&self) -> &PendingManager {
        &self.inner.pending
    }

    /// Saturation counters.
    #[must_use]
    pub fn limiter(&self) -> &Limiter {
        &self.inner.limiter
    }

    /// Queue `hook` to run inside every [`open`](Self::open); runs
    /// immediately when the hub is already open.
    pub fn on_open(&self, hook: impl Fn(&Hub) + Send + Sync + 'static) {
        let hook: OpenHook = Arc::new(hook);
        let run_now = self.is_open();
        self.inner.open_hooks.lock().push(Arc::clone(&hook));
        if run_now {
            hook(self);
        }
    }

    /// Install the handler set. Idempotent.
    pub fn open(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.opened || state.destroyed {
                return;
            }
            state.opened = true;
        }
        let hooks: Vec<OpenHook> = self.inner.open_hooks.lock().clone();
        for hook in hooks {
            hook(self);
        }
    }

    /// Remove the handler set. Pending waiters are kept so in-flight
    /// operations can still resolve. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.opened {
                return;
            }
            state.opened = false;
        }
        let registrations = std::mem::take(&mut *self.inner.registrations.lock());
        for id in registrations {
            self.inner.dispatcher.unregister_handler(id);
        }
    }

    /// Close, clear all pending state and timers, detach from the channel.
    /// Safe to call more than once.
    pub fn destroy(&self) {
        self.close();
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        self.inner.pending.clear_all();
        self.inner.dispatcher.detach();
        channel::release(&self.inner.channel);
    }

    /// Whether the handler set is installed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().opened
    }

    /// Whether [`destroy`](Self::destroy) has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Register a handler on the dispatcher and remember the registration
    /// for mass removal on [`close`](Self::close).
    pub fn register_handler(
        &self,
        matcher: impl Into<KindMatcher>,
        handler: FrameHandler,
        options: HandlerOptions,
    ) -> HandlerId {
        let id = self
            .inner
            .dispatcher
            .register_handler(matcher, handler, options);
        self.inner.registrations.lock().push(id);
        id
    }

    /// Handler options with this hub's version gate baked in.
    #[must_use]
    pub fn create_handler_options(&self, on_version_error: Option<VersionErrorHook>) -> HandlerOptions {
        HandlerOptions {
            priority: 0,
            version_validator: Some(Arc::clone(&self.inner.version_validator)),
            on_version_error,
        }
    }

    /// Reply target for deliveries that carry no source window.
    pub fn set_fallback_target(&self, window: Window, origin: impl Into<String>) {
        self.inner.dispatcher.set_fallback_target(window, origin);
    }

    /// Build a sender bound to one peer.
    #[must_use]
    pub fn create_outbox(
        &self,
        target: Window,
        target_origin: impl Into<String>,
        target_id: Option<String>,
    ) -> Outbox {
        Outbox::new(self.clone(), target, target_origin.into(), target_id)
    }

    /// Run `f` the first time `key` is seen on this hub; later calls are
    /// swallowed. For one-shot diagnostics.
    pub fn warn_once(&self, key: &str, f: impl FnOnce()) {
        if self.inner.warned.lock().insert(key.to_owned()) {
            f();
        }
    }

    /// Origin decision for a delivery, see [`is_origin_allowed`].
    #[must_use]
    pub fn is_origin_allowed_by(
        &self,
        origin: &str,
        frame: &Frame,
        context: &MessageContext,
        expected_origin: Option<&str>,
        validator: Option<&OriginValidator>,
    ) -> bool {
        is_origin_allowed(origin, frame, context, expected_origin, validator)
    }
}

impl Debug for Hub {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("instance_id", &self.inner.instance_id)
            .field("role", &self.inner.role)
            .field("open", &self.is_open())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn role_tag(role: Role) -> &'static str {
    match role {
        Role::Client => "client",
        Role::Server => "server",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    fn hub(role: Role) -> (Window, Hub) {
        let window = Window::new("https://app.test");
        let hub = Hub::new(&window, role, HubOptions::default());
        (window, hub)
    }

    #[tokio::test]
    async fn open_close_are_idempotent_and_hooks_rerun() {
        let (_window, hub) = hub(Role::Server);
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = Arc::clone(&runs);
            hub.on_open(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        hub.open();
        hub.open();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(hub.is_open());

        hub.close();
        hub.close();
        assert!(!hub.is_open());

        hub.open();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        hub.destroy();
    }

    #[tokio::test]
    async fn close_removes_handlers_but_keeps_pending() {
        let (_window, hub) = hub(Role::Server);
        hub.open();
        hub.register_handler(
            "ping",
            Arc::new(|_, _| Ok(())),
            HandlerOptions::default(),
        );
        hub.pending().insert(PENDING_REQUESTS, "r1", 7u32);

        hub.close();
        assert!(hub.pending().contains(PENDING_REQUESTS, "r1"));

        hub.destroy();
        assert!(!hub.pending().contains(PENDING_REQUESTS, "r1"));
    }

    #[tokio::test]
    async fn destroy_clears_timers_and_is_terminal() {
        let (window, hub) = hub(Role::Client);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            hub.pending()
                .set_timeout(Duration::from_millis(10), move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                });
        }
        hub.destroy();
        hub.destroy();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(hub.is_destroyed());
        assert_eq!(window.listener_count(), 0);
    }

    #[tokio::test]
    async fn warn_once_fires_once_per_key() {
        let (_window, hub) = hub(Role::Client);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            hub.warn_once("late-response", move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        hub.destroy();
    }

    #[tokio::test]
    async fn two_hubs_share_one_channel() {
        let window = Window::new("https://app.test");
        let first = Hub::new(&window, Role::Server, HubOptions {
            secret_key: Some("k".into()),
            ..Default::default()
        });
        let second = Hub::new(&window, Role::Server, HubOptions {
            secret_key: Some("k".into()),
            ..Default::default()
        });
        assert_eq!(window.listener_count(), 1);
        assert_eq!(first.channel().ref_count(), 2);

        first.destroy();
        assert_eq!(window.listener_count(), 1);
        second.destroy();
        assert_eq!(window.listener_count(), 0);
    }
}
