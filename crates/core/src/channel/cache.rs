//! Process-wide channel registry.
//!
//! The runtime equivalent of a well-known per-window singleton: channels are
//! keyed by `(window id, secret key)` and shared by reference count, so any
//! number of endpoints in the same process reuse one window listener per key
//! and several copies of the library cannot shadow each other's channels.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;

use super::Channel;
use crate::conn::Window;

type CacheKey = (u64, Option<String>);

static CHANNELS: LazyLock<Mutex<HashMap<CacheKey, Channel>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Get or create the shared channel for `(window, secret_key)` and take a
/// reference on it.
pub(crate) fn acquire(window: &Window, secret_key: Option<String>) -> Channel {
    let key = (window.id(), secret_key.clone());
    let mut channels = CHANNELS.lock();
    let channel = channels
        .entry(key)
        .or_insert_with(|| Channel::new(window.clone(), secret_key))
        .clone();
    channel.add_ref();
    channel
}

/// Drop a reference; the last one detaches the window listener and evicts
/// the cache entry.
pub(crate) fn release(channel: &Channel) {
    let mut channels = CHANNELS.lock();
    if channel.release() == 0 {
        channel.detach();
        let key = (
            channel.window().id(),
            channel.secret_key().map(ToOwned::to_owned),
        );
        channels.remove(&key);
    }
}

/// Whether the cache still holds an entry for `(window, secret_key)`.
#[cfg(test)]
pub(crate) fn contains(window: &Window, secret_key: Option<&str>) -> bool {
    CHANNELS
        .lock()
        .contains_key(&(window.id(), secret_key.map(ToOwned::to_owned)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_shares_one_channel_and_listener() {
        let window = Window::new("https://app.test");
        let first = acquire(&window, Some("k".into()));
        let second = acquire(&window, Some("k".into()));
        assert_eq!(first.window().id(), second.window().id());
        assert_eq!(first.ref_count(), 2);
        assert_eq!(window.listener_count(), 1);

        // A different key gets its own subscription.
        let other = acquire(&window, Some("k2".into()));
        assert_eq!(window.listener_count(), 2);

        release(&first);
        release(&second);
        release(&other);
    }

    #[tokio::test]
    async fn last_release_evicts_and_detaches() {
        let window = Window::new("https://app.test");
        let first = acquire(&window, Some("gone".into()));
        let second = acquire(&window, Some("gone".into()));
        assert!(contains(&window, Some("gone")));

        release(&first);
        assert!(contains(&window, Some("gone")));
        release(&second);
        assert!(!contains(&window, Some("gone")));
        assert_eq!(window.listener_count(), 0);
    }
}
