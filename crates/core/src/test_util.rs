//! Utilities for testing fabric applications.
//!
//! [`window_pair`] builds the two sides of a parent/frame arrangement;
//! [`WireTap`] records every fabric frame delivered to a window so tests
//! can assert on observable traffic instead of internals.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, sleep};

use crate::conn::Window;
use crate::proto::Frame;

/// A parent window and a frame window with distinct origins.
#[must_use]
pub fn window_pair() -> (Window, Window) {
    (
        Window::new("https://parent.test"),
        Window::new("https://frame.test"),
    )
}

/// Let queued deliveries and spawned work drain.
pub async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

/// Records every decodable frame delivered to a window.
#[derive(Clone)]
pub struct WireTap {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl WireTap {
    /// Attach a tap to `window`.
    pub fn attach(window: &Window) -> Self {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        window.add_listener(move |event| {
            if let Some(frame) = Frame::decode(&event.data) {
                sink.lock().push(frame);
            }
        });
        Self { frames }
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// The recorded frame kinds, in arrival order.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.frames.lock().iter().map(|f| f.kind.clone()).collect()
    }

    /// Recorded frames of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: &str) -> Vec<Frame> {
        self.frames
            .lock()
            .iter()
            .filter(|frame| frame.kind == kind)
            .cloned()
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl std::fmt::Debug for WireTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireTap")
            .field("frames", &self.frames.lock().len())
            .finish()
    }
}
