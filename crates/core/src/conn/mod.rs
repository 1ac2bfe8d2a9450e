//! The host-window runtime the fabric is layered on.
//!
//! A [`Window`] stands in for a browser window: it has an origin, it can be
//! closed, and anyone holding a handle can post a message to it. Delivery is
//! deliberately adversarial in the same ways `postMessage` is: every listener
//! on the window sees every delivery, sends are best-effort with no
//! acknowledgment, and a window can disappear mid-exchange.

mod window;

pub use window::{ListenerId, MessageEvent, Window};
