use crate::badge::{BadgeSink, Indicator};
use crate::model::{FrameCommand, FrameEvent, FrameId, PopupEvent, TabId};
use crate::peer::{post_event, Peer};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Blocked attempts at or above which a spamming tab is closed.
pub const SPAM_THRESHOLD: i64 = 10;

/// Counter values above this no longer change the badge.
const BADGE_REDRAW_LIMIT: i64 = 1000;

/// Closes tabs on behalf of the coordinator.
pub trait TabLifecycle: Send + Sync {
    fn terminate(&self, tab: TabId);
}

/// Collaborators a tab needs while handling an event.
pub struct TabContext<'a> {
    pub badge: &'a dyn BadgeSink,
    pub lifecycle: &'a dyn TabLifecycle,
    pub close_on_spam: bool,
}

/// State for one tab with at least one connected frame.
pub struct TabSession {
    id: TabId,
    counter: i64,
    allow_once: bool,
    closing: bool,
    pipes: BTreeMap<FrameId, Arc<dyn Peer>>,
}

impl TabSession {
    pub fn new(id: TabId) -> Self {
        Self {
            id,
            counter: 0,
            allow_once: false,
            closing: false,
            pipes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn counter(&self) -> i64 {
        self.counter
    }

    pub fn allow_once(&self) -> bool {
        self.allow_once
    }

    pub fn frames(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.pipes.keys().copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<dyn Peer>> + '_ {
        self.pipes.values()
    }

    /// Stores `peer` for `frame`. A peer already holding that frame is
    /// disconnected and returned so the caller can forget its route.
    pub fn connect(&mut self, frame: FrameId, peer: Arc<dyn Peer>) -> Option<Arc<dyn Peer>> {
        let displaced = self.pipes.insert(frame, peer);
        if let Some(old) = &displaced {
            tracing::info!(tab = %self.id, frame = %frame, conn = %old.id(), "replacing frame connection");
            old.disconnect();
        }
        displaced
    }

    /// Drops the frame's peer and reports whether the tab has no frames left.
    pub fn on_disconnect(&mut self, frame: FrameId) -> bool {
        self.pipes.remove(&frame);
        self.pipes.is_empty()
    }

    /// Applies a frame command. Returns the event every popup bound to this
    /// tab should receive, if any.
    pub fn on_message(&mut self, command: FrameCommand, ctx: &TabContext<'_>) -> Option<PopupEvent> {
        match command {
            FrameCommand::AttemptBlocked => {
                self.count(ctx);
                None
            }
            FrameCommand::AllowOnceUsed => {
                self.revoke_allow_once(ctx);
                Some(PopupEvent::RevokeAllowOnce)
            }
            // A freshly injected frame always starts out blocking.
            FrameCommand::Injected => Some(PopupEvent::RevokeAllowOnce),
        }
    }

    pub fn grant_allow_once(&mut self, ctx: &TabContext<'_>) {
        self.allow_once = true;
        self.broadcast(FrameEvent::AllowOnce);
        ctx.badge.set_indicator(self.id, Indicator::allowing());
    }

    /// Clears allow-once everywhere and resets the counter to a visible zero.
    pub fn revoke_allow_once(&mut self, ctx: &TabContext<'_>) {
        self.allow_once = false;
        self.broadcast(FrameEvent::RevokeAllowOnce);
        self.counter = -1;
        self.count(ctx);
    }

    pub fn broadcast(&self, event: FrameEvent) {
        for peer in self.pipes.values() {
            post_event(peer.as_ref(), &event);
        }
    }

    pub fn count(&mut self, ctx: &TabContext<'_>) {
        self.counter += 1;
        if self.counter <= BADGE_REDRAW_LIMIT {
            ctx.badge.set_indicator(self.id, Indicator::counter(self.counter));
        }

        if ctx.close_on_spam && self.counter >= SPAM_THRESHOLD {
            self.close(ctx);
        }
    }

    /// Asks the lifecycle to close this tab. Later calls are no-ops while the
    /// first request is in flight.
    pub fn close(&mut self, ctx: &TabContext<'_>) {
        if self.closing {
            return;
        }
        self.closing = true;
        tracing::warn!(tab = %self.id, blocked = self.counter, "closing tab after repeated install attempts");
        ctx.lifecycle.terminate(self.id);
    }
}
