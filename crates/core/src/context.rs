//! Per-delivery context shared by every receiver of one inbound frame.
//!
//! The ownership markers are the cooperative lock between co-resident
//! endpoints listening on the same channel: whoever intends to answer a
//! frame claims it by marking `handled_by`, and everyone else backs off.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::conn::Window;

/// Derived processing stage of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Nobody touched the frame yet.
    Pending,
    /// Some endpoint started working on it.
    Handling,
    /// Some endpoint positively accepted it as addressed to itself.
    Accepted,
    /// Processing finished.
    Done,
}

type StageWatcher = Arc<dyn Fn(Stage) + Send + Sync>;

#[derive(Default)]
struct OwnerState {
    handled_by: Option<String>,
    accepted_by: Option<String>,
    done_by: Option<String>,
    watchers: HashMap<String, StageWatcher>,
}

impl OwnerState {
    fn stage(&self) -> Stage {
        if self.done_by.is_some() {
            Stage::Done
        } else if self.accepted_by.is_some() {
            Stage::Accepted
        } else if self.handled_by.is_some() {
            Stage::Handling
        } else {
            Stage::Pending
        }
    }
}

struct ContextInner {
    origin: String,
    source: Option<Window>,
    state: Mutex<OwnerState>,
    ack_sent: AtomicBool,
}

/// Context attached to one inbound delivery.
///
/// Clones share state; a fresh context is built per delivery, never per
/// receiver. All markers are monotone: once set they are never cleared, and
/// a second marker for the same slot is ignored.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<ContextInner>,
}

impl MessageContext {
    /// New context for a delivery from `origin`, optionally carrying the
    /// sending window.
    #[must_use]
    pub fn new(origin: impl Into<String>, source: Option<Window>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                origin: origin.into(),
                source,
                state: Mutex::new(OwnerState::default()),
                ack_sent: AtomicBool::new(false),
            }),
        }
    }

    /// Origin the delivery arrived from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// The sending window, when known.
    #[must_use]
    pub fn source(&self) -> Option<&Window> {
        self.inner.source.as_ref()
    }

    /// Current derived stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.inner.state.lock().stage()
    }

    /// Who claimed the frame, if anyone.
    #[must_use]
    pub fn handled_by(&self) -> Option<String> {
        self.inner.state.lock().handled_by.clone()
    }

    /// Who accepted the frame, if anyone.
    #[must_use]
    pub fn accepted_by(&self) -> Option<String> {
        self.inner.state.lock().accepted_by.clone()
    }

    /// Who finished the frame, if anyone.
    #[must_use]
    pub fn done_by(&self) -> Option<String> {
        self.inner.state.lock().done_by.clone()
    }

    /// Claim the frame. Returns `false` when it was already claimed.
    pub fn mark_handled_by(&self, id: &str) -> bool {
        self.transition(|state| {
            if state.handled_by.is_some() {
                return false;
            }
            state.handled_by = Some(id.to_owned());
            true
        })
    }

    /// Accept the frame as addressed to `id`. Also claims it when nobody
    /// did yet. Returns `false` when already accepted.
    pub fn mark_accepted_by(&self, id: &str) -> bool {
        self.transition(|state| {
            if state.accepted_by.is_some() {
                return false;
            }
            if state.handled_by.is_none() {
                state.handled_by = Some(id.to_owned());
            }
            state.accepted_by = Some(id.to_owned());
            true
        })
    }

    /// Mark processing finished. Returns `false` when already done.
    pub fn mark_done_by(&self, id: &str) -> bool {
        self.transition(|state| {
            if state.done_by.is_some() {
                return false;
            }
            state.done_by = Some(id.to_owned());
            true
        })
    }

    /// Subscribe to stage transitions under `name`; a second subscription
    /// with the same name replaces the first. The callback fires only when
    /// the stage actually changes.
    pub fn on_state_change(&self, name: impl Into<String>, watcher: impl Fn(Stage) + Send + Sync + 'static) {
        self.inner
            .state
            .lock()
            .watchers
            .insert(name.into(), Arc::new(watcher));
    }

    /// One-shot marker used by the dispatcher so a frame is acked at most
    /// once. Returns `true` for the first caller only.
    pub(crate) fn mark_ack_sent(&self) -> bool {
        !self.inner.ack_sent.swap(true, Ordering::SeqCst)
    }

    fn transition(&self, apply: impl FnOnce(&mut OwnerState) -> bool) -> bool {
        let (changed, stage, watchers) = {
            let mut state = self.inner.state.lock();
            let before = state.stage();
            let changed = apply(&mut state);
            let after = state.stage();
            if changed && after != before {
                let watchers: Vec<StageWatcher> = state.watchers.values().cloned().collect();
                (changed, Some(after), watchers)
            } else {
                (changed, None, Vec::new())
            }
        };
        if let Some(stage) = stage {
            for watcher in watchers {
                watcher(stage);
            }
        }
        changed
    }
}

impl Debug for MessageContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageContext")
            .field("origin", &self.inner.origin)
            .field("stage", &state.stage())
            .field("handled_by", &state.handled_by)
            .field("accepted_by", &state.accepted_by)
            .field("done_by", &state.done_by)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_monotone() {
        let ctx = MessageContext::new("https://peer.test", None);
        assert_eq!(ctx.stage(), Stage::Pending);

        assert!(ctx.mark_handled_by("s1"));
        assert!(!ctx.mark_handled_by("s2"));
        assert_eq!(ctx.handled_by().as_deref(), Some("s1"));
        assert_eq!(ctx.stage(), Stage::Handling);

        assert!(ctx.mark_done_by("s1"));
        assert!(!ctx.mark_done_by("s2"));
        assert_eq!(ctx.stage(), Stage::Done);
    }

    #[test]
    fn accepting_also_claims() {
        let ctx = MessageContext::new("https://peer.test", None);
        assert!(ctx.mark_accepted_by("c1"));
        assert_eq!(ctx.handled_by().as_deref(), Some("c1"));
        assert_eq!(ctx.accepted_by().as_deref(), Some("c1"));
        assert_eq!(ctx.stage(), Stage::Accepted);
        // A later claim by someone else is ignored.
        assert!(!ctx.mark_accepted_by("c2"));
        assert_eq!(ctx.accepted_by().as_deref(), Some("c1"));
    }

    #[test]
    fn watchers_fire_on_transitions_only() {
        let ctx = MessageContext::new("https://peer.test", None);
        let stages = Arc::new(Mutex::new(Vec::new()));
        {
            let stages = Arc::clone(&stages);
            ctx.on_state_change("test", move |stage| stages.lock().push(stage));
        }

        ctx.mark_handled_by("a");
        ctx.mark_handled_by("b"); // no transition
        ctx.mark_accepted_by("a");
        ctx.mark_done_by("a");
        ctx.mark_done_by("b"); // no transition

        assert_eq!(
            *stages.lock(),
            vec![Stage::Handling, Stage::Accepted, Stage::Done]
        );
    }

    #[test]
    fn ack_marker_is_one_shot() {
        let ctx = MessageContext::new("https://peer.test", None);
        assert!(ctx.mark_ack_sent());
        assert!(!ctx.mark_ack_sent());
    }
}
