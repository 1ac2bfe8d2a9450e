use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

/// One message delivery as a listener observes it.
#[derive(Clone)]
pub struct MessageEvent {
    /// The posted payload.
    pub data: Value,
    /// Origin of the sending window.
    pub origin: String,
    /// Handle to the sending window, when it is still known.
    pub source: Option<Window>,
}

impl Debug for MessageEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEvent")
            .field("origin", &self.origin)
            .field("data", &self.data)
            .finish()
    }
}

/// Token returned by [`Window::add_listener`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

struct WindowInner {
    id: u64,
    origin: String,
    closed: AtomicBool,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    queue: mpsc::UnboundedSender<MessageEvent>,
}

/// A cheaply clonable handle to an in-process window.
///
/// Each window owns a single pump task that drains its delivery queue and
/// invokes every registered listener, in registration order, one delivery at
/// a time. That serialization is the event-loop guarantee the upper layers
/// rely on: two listeners never observe the same delivery concurrently.
#[derive(Clone)]
pub struct Window {
    inner: Arc<WindowInner>,
}

impl Window {
    /// Create a window with the given origin and spawn its pump task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEvent>();
        let inner = Arc::new(WindowInner {
            id: NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed),
            origin: origin.into(),
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            queue: tx,
        });
        let pump = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = pump.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let listeners: Vec<Listener> = inner
                    .listeners
                    .lock()
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                drop(inner);
                for listener in listeners {
                    listener(&event);
                }
            }
        });
        Self { inner }
    }

    /// Process-unique id of this window.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The window's origin.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Mark this window closed. Pending and future deliveries are discarded.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// `true` while `target` can still receive messages.
    #[must_use]
    pub fn is_available(target: &Self) -> bool {
        !target.is_closed() && !target.inner.queue.is_closed()
    }

    /// Register a listener that observes every delivery on this window.
    pub fn add_listener(&self, listener: impl Fn(&MessageEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Remove a listener registered with [`add_listener`](Self::add_listener).
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .retain(|(listener_id, _)| *listener_id != id.0);
    }

    /// Number of listeners currently registered.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Post `data` to `target`.
    ///
    /// Delivery happens only when the target is still available and
    /// `target_origin` is `"*"` or equals the target's origin. Returns
    /// whether the message was queued; it never errors, matching the
    /// fire-and-forget nature of the primitive.
    pub fn post_message(&self, target: &Self, data: Value, target_origin: &str) -> bool {
        if target.is_closed() {
            return false;
        }
        if target_origin != "*" && target_origin != target.origin() {
            return false;
        }
        let event = MessageEvent {
            data,
            origin: self.inner.origin.clone(),
            source: Some(self.clone()),
        };
        target.inner.queue.send(event).is_ok()
    }
}

impl Debug for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Window {}
