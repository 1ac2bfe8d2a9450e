//! The shared per-window channel.
//!
//! A [`Channel`] owns the one listener an endpoint family installs on a
//! window. It filters raw deliveries down to fabric frames for its
//! `secret_key`, lifts each surviving delivery into a fresh
//! [`MessageContext`], and fans it to every registered receiver. Endpoints
//! created with the same `(window, secret_key)` pair share a single channel
//! through the ref-counted [`cache`], which is what keeps co-resident
//! endpoints from waking up once per endpoint for every broadcast delivery.

mod cache;

pub(crate) use cache::{acquire, release};

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::conn::{ListenerId, MessageEvent, Window};
use crate::context::MessageContext;
use crate::proto::Frame;

/// Token for removing a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

/// Receivers observe each accepted delivery; one receiver per endpoint.
pub type Receiver = Arc<dyn Fn(&Frame, &MessageContext) -> crate::Result<()> + Send + Sync>;

pub(crate) struct ChannelInner {
    window: Window,
    secret_key: Option<String>,
    receivers: Mutex<Vec<(u64, Receiver)>>,
    next_receiver: AtomicU64,
    listener: Mutex<Option<ListenerId>>,
    refs: AtomicUsize,
}

/// A shared subscription to one window, scoped to one `secret_key`.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel and install its window listener.
    ///
    /// Prefer going through a `Hub`, which acquires channels from the
    /// shared cache; direct construction is for tests.
    #[must_use]
    pub fn new(window: Window, secret_key: Option<String>) -> Self {
        let inner = Arc::new(ChannelInner {
            window: window.clone(),
            secret_key,
            receivers: Mutex::new(Vec::new()),
            next_receiver: AtomicU64::new(1),
            listener: Mutex::new(None),
            refs: AtomicUsize::new(0),
        });
        let weak: Weak<ChannelInner> = Arc::downgrade(&inner);
        let listener = window.add_listener(move |event| {
            if let Some(inner) = weak.upgrade() {
                Self::on_message(&inner, event);
            }
        });
        *inner.listener.lock() = Some(listener);
        Self { inner }
    }

    /// The window this channel listens on.
    #[must_use]
    pub fn window(&self) -> &Window {
        &self.inner.window
    }

    /// The channel's isolation key.
    #[must_use]
    pub fn secret_key(&self) -> Option<&str> {
        self.inner.secret_key.as_deref()
    }

    /// Namespace a route path with the channel key: `"{key}:{path}"`.
    #[must_use]
    pub fn prefix_path(&self, path: &str) -> String {
        match &self.inner.secret_key {
            Some(key) => format!("{key}:{path}"),
            None => path.to_owned(),
        }
    }

    /// Register a receiver; receivers run in registration order.
    pub fn add_receiver(&self, receiver: Receiver) -> ReceiverId {
        let id = self.inner.next_receiver.fetch_add(1, Ordering::Relaxed);
        self.inner.receivers.lock().push((id, receiver));
        ReceiverId(id)
    }

    /// Remove a previously registered receiver.
    pub fn remove_receiver(&self, id: ReceiverId) {
        self.inner
            .receivers
            .lock()
            .retain(|(receiver_id, _)| *receiver_id != id.0);
    }

    /// Number of registered receivers, for diagnostics.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.inner.receivers.lock().len()
    }

    /// Take a lifetime reference. Returns the new count.
    pub fn add_ref(&self) -> usize {
        self.inner.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop a lifetime reference. Returns the new count; `0` tells the
    /// cache to destroy and evict this channel.
    pub fn release(&self) -> usize {
        let before = self.inner.refs.load(Ordering::SeqCst);
        if before == 0 {
            return 0;
        }
        self.inner.refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Current lifetime reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::SeqCst)
    }

    /// Detach the window listener. Called by the cache on eviction.
    pub(crate) fn detach(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            self.inner.window.remove_listener(listener);
        }
    }

    /// Low-level emit of an already-encoded frame.
    ///
    /// Returns `false` without error when the target window is gone or the
    /// frame cannot be encoded; a vanished peer must never crash a sender.
    pub fn send(&self, target: &Window, frame: &Frame, target_origin: &str) -> bool {
        if !Window::is_available(target) {
            return false;
        }
        let Ok(value) = frame.encode() else {
            tracing::error!(kind = %frame.kind, "frame failed to encode, dropping send");
            return false;
        };
        self.inner.window.post_message(target, value, target_origin)
    }

    /// Emit a frame with this channel's `secret_key` stamped on.
    pub fn send_message(&self, target: &Window, target_origin: &str, mut frame: Frame) -> bool {
        frame.secret_key = self.inner.secret_key.clone();
        self.send(target, &frame, target_origin)
    }

    fn on_message(inner: &Arc<ChannelInner>, event: &MessageEvent) {
        let Some(frame) = Self::screen(inner, &event.data) else {
            return;
        };
        let context = MessageContext::new(event.origin.clone(), event.source.clone());
        let receivers: Vec<Receiver> = inner
            .receivers
            .lock()
            .iter()
            .map(|(_, receiver)| Arc::clone(receiver))
            .collect();
        for receiver in receivers {
            if let Err(error) = receiver(&frame, &context) {
                tracing::error!(%error, kind = %frame.kind, request_id = %frame.request_id,
                    "channel receiver failed; continuing with remaining receivers");
            }
        }
    }

    /// Structural and key screening: non-frames and frames for another key
    /// never reach a receiver.
    fn screen(inner: &ChannelInner, data: &Value) -> Option<Frame> {
        let frame = Frame::decode(data)?;
        if frame.secret_key.as_deref() != inner.secret_key.as_deref() {
            tracing::trace!(kind = %frame.kind, "dropping frame with mismatched secret key");
            return None;
        }
        Some(frame)
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("window", &self.inner.window.id())
            .field("secret_key", &self.inner.secret_key)
            .field("receivers", &self.receiver_count())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::kind;
    use serde_json::json;
    use tokio::time::{Duration, sleep};

    fn collect_kinds(channel: &Channel) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.add_receiver(Arc::new(move |frame, _ctx| {
            sink.lock().push(frame.kind.clone());
            Ok(())
        }));
        seen
    }

    #[tokio::test]
    async fn key_mismatch_never_reaches_receivers() {
        let local = Window::new("https://app.test");
        let peer = Window::new("https://peer.test");
        let keyed = Channel::new(local.clone(), Some("k".into()));
        let seen = collect_kinds(&keyed);

        // Same key: delivered.
        let mut frame = Frame::new(kind::PING, "r1");
        frame.secret_key = Some("k".into());
        peer.post_message(&local, frame.encode().expect("encode"), "*");
        // Wrong key: dropped.
        let mut frame = Frame::new(kind::PING, "r2");
        frame.secret_key = Some("other".into());
        peer.post_message(&local, frame.encode().expect("encode"), "*");
        // No key while the channel has one: dropped.
        let frame = Frame::new(kind::PING, "r3");
        peer.post_message(&local, frame.encode().expect("encode"), "*");

        sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn keyless_channel_drops_keyed_frames() {
        let local = Window::new("https://app.test");
        let peer = Window::new("https://peer.test");
        let channel = Channel::new(local.clone(), None);
        let seen = collect_kinds(&channel);

        let mut keyed = Frame::new(kind::PING, "r1");
        keyed.secret_key = Some("k".into());
        peer.post_message(&local, keyed.encode().expect("encode"), "*");
        let bare = Frame::new(kind::PING, "r2");
        peer.post_message(&local, bare.encode().expect("encode"), "*");

        sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec!["ping".to_owned()]);
    }

    #[tokio::test]
    async fn foreign_messages_are_ignored() {
        let local = Window::new("https://app.test");
        let peer = Window::new("https://peer.test");
        let channel = Channel::new(local.clone(), None);
        let seen = collect_kinds(&channel);

        peer.post_message(&local, json!("unrelated"), "*");
        peer.post_message(&local, json!({"some": "object"}), "*");
        sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn receiver_error_does_not_starve_the_rest() {
        let local = Window::new("https://app.test");
        let peer = Window::new("https://peer.test");
        let channel = Channel::new(local.clone(), None);

        channel.add_receiver(Arc::new(|_, _| {
            Err(crate::Error::Other("boom".into()))
        }));
        let seen = collect_kinds(&channel);

        peer.post_message(
            &local,
            Frame::new(kind::PING, "r1").encode().expect("encode"),
            "*",
        );
        sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn prefix_path_uses_key() {
        let window = Window::new("https://app.test");
        let keyed = Channel::new(window.clone(), Some("k1".into()));
        assert_eq!(keyed.prefix_path("/users"), "k1:/users");
        let bare = Channel::new(window, None);
        assert_eq!(bare.prefix_path("/users"), "/users");
    }

    #[tokio::test]
    async fn send_to_closed_window_reports_false() {
        let window = Window::new("https://app.test");
        let gone = Window::new("https://peer.test");
        gone.close();
        let channel = Channel::new(window, None);
        assert!(!channel.send(&gone, &Frame::new(kind::PING, "r1"), "*"));
    }
}
