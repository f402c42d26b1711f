mod popup;
mod tab;


pub use tab::TabLifecycle;

use crate::badge::BadgeSink;
use crate::model::{
    ConnectionId, FrameCommand, FrameId, PopupEvent, PopupKey, SenderInfo, TabId,
    CONTENT_CHANNEL, POPUP_CHANNEL,
};
use crate::peer::Peer;
use crate::settings::{close_on_spam_from, Debouncer, SettingsStore, CLOSE_ON_SPAM_KEY};
use popup::{PopupContext, PopupSession, TabFanout};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tab::{TabContext, TabSession};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

pub enum CoordinatorEvent {
    Connected {
        peer: Arc<dyn Peer>,
        name: String,
        sender: SenderInfo,
    },
    Message {
        conn: ConnectionId,
        message: Value,
    },
    Disconnected {
        conn: ConnectionId,
    },
    TerminateTab(TabId),
    Snapshot(oneshot::Sender<RegistrySnapshot>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Frame { tab: TabId, frame: FrameId },
    Popup(PopupKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Frame(TabId),
    Popup(PopupKey),
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabSnapshot {
    pub id: TabId,
    pub counter: i64,
    #[serde(rename = "allowOnce")]
    pub allow_once: bool,
    pub frames: Vec<FrameId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopupSnapshot {
    pub key: PopupKey,
    pub tab: Option<TabId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "closeOnSpam")]
    pub close_on_spam: bool,
    pub tabs: Vec<TabSnapshot>,
    pub popups: Vec<PopupSnapshot>,
}

/// Owns every tab and popup session plus the shared `closeOnSpam` flag.
pub struct Registry {
    tabs: HashMap<TabId, TabSession>,
    popups: BTreeMap<PopupKey, PopupSession>,
    routes: HashMap<ConnectionId, Route>,
    next_popup_key: u64,
    close_on_spam: bool,
    badge: Arc<dyn BadgeSink>,
    lifecycle: Arc<dyn TabLifecycle>,
    persist: Debouncer,
}

impl Registry {
    pub fn new(
        badge: Arc<dyn BadgeSink>,
        lifecycle: Arc<dyn TabLifecycle>,
        persist: Debouncer,
    ) -> Self {
        Self {
            tabs: HashMap::new(),
            popups: BTreeMap::new(),
            routes: HashMap::new(),
            next_popup_key: 0,
            close_on_spam: true,
            badge,
            lifecycle,
            persist,
        }
    }

    pub fn dispatch(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected { peer, name, sender } => {
                self.admit(peer, &name, sender);
            }
            CoordinatorEvent::Message { conn, message } => self.on_message(conn, &message),
            CoordinatorEvent::Disconnected { conn } => self.on_disconnect(conn),
            CoordinatorEvent::TerminateTab(tab) => self.terminate_tab(tab),
            CoordinatorEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Routes a new connection by its declared channel name.
    pub fn admit(&mut self, peer: Arc<dyn Peer>, name: &str, sender: SenderInfo) -> Admission {
        match name {
            CONTENT_CHANNEL => match sender.tab {
                Some(tab) => {
                    self.connect_frame(tab, sender.frame, peer);
                    Admission::Frame(tab)
                }
                None => {
                    tracing::debug!(conn = %peer.id(), "rejecting content connection without a tab");
                    peer.disconnect();
                    Admission::Rejected
                }
            },
            POPUP_CHANNEL => {
                let key = PopupKey(self.next_popup_key);
                self.next_popup_key += 1;
                self.routes.insert(peer.id(), Route::Popup(key));
                self.popups.insert(key, PopupSession::new(key, peer));
                tracing::debug!(popup = %key, "popup connected");
                Admission::Popup(key)
            }
            other => {
                tracing::debug!(conn = %peer.id(), channel = %other, "rejecting connection on unknown channel");
                peer.disconnect();
                Admission::Rejected
            }
        }
    }

    fn connect_frame(&mut self, tab: TabId, frame: FrameId, peer: Arc<dyn Peer>) {
        let conn = peer.id();
        let session = self.tabs.entry(tab).or_insert_with(|| {
            tracing::debug!(tab = %tab, "tracking tab");
            TabSession::new(tab)
        });
        if let Some(displaced) = session.connect(frame, peer) {
            // The old transport may still report a disconnect; it must not
            // remove the peer that replaced it.
            self.routes.remove(&displaced.id());
        }
        self.routes.insert(conn, Route::Frame { tab, frame });
    }

    pub fn on_message(&mut self, conn: ConnectionId, message: &Value) {
        match self.routes.get(&conn).copied() {
            Some(Route::Frame { tab, .. }) => self.on_frame_message(tab, message),
            Some(Route::Popup(key)) => self.on_popup_message(key, message),
            None => {}
        }
    }

    fn on_frame_message(&mut self, tab: TabId, message: &Value) {
        let Some(command) = FrameCommand::parse(message) else {
            return;
        };
        let Some(session) = self.tabs.get_mut(&tab) else {
            return;
        };
        let ctx = TabContext {
            badge: self.badge.as_ref(),
            lifecycle: self.lifecycle.as_ref(),
            close_on_spam: self.close_on_spam,
        };
        if let Some(event) = session.on_message(command, &ctx) {
            self.notify_tab_popups(tab, &event);
        }
    }

    fn on_popup_message(&mut self, key: PopupKey, message: &Value) {
        let Some(popup) = self.popups.get_mut(&key) else {
            return;
        };
        let ctx = PopupContext {
            tabs: &mut self.tabs,
            tab: TabContext {
                badge: self.badge.as_ref(),
                lifecycle: self.lifecycle.as_ref(),
                close_on_spam: self.close_on_spam,
            },
            close_on_spam: &mut self.close_on_spam,
            persist: &mut self.persist,
        };
        if let Some(TabFanout { tab, event }) = popup.on_message(message, ctx) {
            self.notify_tab_popups(tab, &event);
        }
    }

    pub fn on_disconnect(&mut self, conn: ConnectionId) {
        match self.routes.remove(&conn) {
            Some(Route::Frame { tab, frame }) => {
                let emptied = self
                    .tabs
                    .get_mut(&tab)
                    .map(|session| session.on_disconnect(frame))
                    .unwrap_or(false);
                if emptied {
                    self.tabs.remove(&tab);
                    self.badge.clear(tab);
                    tracing::debug!(tab = %tab, "last frame gone, dropping tab");
                }
            }
            Some(Route::Popup(key)) => {
                if let Some(popup) = self.popups.remove(&key) {
                    popup.on_disconnect();
                }
            }
            None => {}
        }
    }

    /// Disconnects every frame of `tab`. The session is torn down as each
    /// transport reports its disconnect.
    pub fn terminate_tab(&mut self, tab: TabId) {
        if let Some(session) = self.tabs.get(&tab) {
            tracing::info!(tab = %tab, frames = session.frames().count(), "terminating tab");
            for peer in session.peers() {
                peer.disconnect();
            }
        }
    }

    /// Records a new `closeOnSpam` value and tells every open popup.
    pub fn apply_close_on_spam(&mut self, enabled: bool) {
        self.close_on_spam = enabled;
        let event = PopupEvent::close_on_spam(enabled);
        for popup in self.popups.values() {
            popup.post(&event);
        }
    }

    fn notify_tab_popups(&self, tab: TabId, event: &PopupEvent) {
        for popup in self.popups.values().filter(|p| p.is_bound_to(tab)) {
            popup.post(event);
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut tabs: Vec<TabSnapshot> = self
            .tabs
            .values()
            .map(|session| TabSnapshot {
                id: session.id(),
                counter: session.counter(),
                allow_once: session.allow_once(),
                frames: session.frames().collect(),
            })
            .collect();
        tabs.sort_by_key(|t| t.id);

        RegistrySnapshot {
            close_on_spam: self.close_on_spam,
            tabs,
            popups: self
                .popups
                .values()
                .map(|popup| PopupSnapshot {
                    key: popup.key(),
                    tab: popup.tab(),
                })
                .collect(),
        }
    }
}

/// Terminates tabs by queueing a request back onto the coordinator.
#[derive(Debug, Clone)]
pub struct QueuedLifecycle {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl TabLifecycle for QueuedLifecycle {
    fn terminate(&self, tab: TabId) {
        let _ = self.tx.send(CoordinatorEvent::TerminateTab(tab));
    }
}

/// Cloneable entry point for transports.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn connected(&self, peer: Arc<dyn Peer>, name: impl Into<String>, sender: SenderInfo) {
        let _ = self.tx.send(CoordinatorEvent::Connected {
            peer,
            name: name.into(),
            sender,
        });
    }

    pub fn message(&self, conn: ConnectionId, message: Value) {
        let _ = self.tx.send(CoordinatorEvent::Message { conn, message });
    }

    pub fn disconnected(&self, conn: ConnectionId) {
        let _ = self.tx.send(CoordinatorEvent::Disconnected { conn });
    }

    pub async fn snapshot(&self) -> Option<RegistrySnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(CoordinatorEvent::Snapshot(reply_tx)).ok()?;
        reply_rx.await.ok()
    }
}

impl std::fmt::Debug for CoordinatorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected { peer, name, sender } => f
                .debug_struct("Connected")
                .field("conn", &peer.id())
                .field("name", name)
                .field("sender", sender)
                .finish(),
            Self::Message { conn, message } => f
                .debug_struct("Message")
                .field("conn", conn)
                .field("message", message)
                .finish(),
            Self::Disconnected { conn } => {
                f.debug_struct("Disconnected").field("conn", conn).finish()
            }
            Self::TerminateTab(tab) => f.debug_tuple("TerminateTab").field(tab).finish(),
            Self::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

/// Single task that serializes every registry mutation.
pub struct Coordinator {
    registry: Registry,
    events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    store: SettingsStore,
}

impl Coordinator {
    pub fn new(
        store: SettingsStore,
        badge: Arc<dyn BadgeSink>,
        write_debounce: Duration,
    ) -> (Self, CoordinatorHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(QueuedLifecycle { tx: tx.clone() });
        let persist = Debouncer::new(store.clone(), write_debounce);
        let registry = Registry::new(badge, lifecycle, persist);
        (
            Self {
                registry,
                events,
                store,
            },
            CoordinatorHandle { tx },
        )
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.subscribe();
        self.reload_close_on_spam().await;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.registry.dispatch(event),
                    None => break,
                },
                change = changes.recv() => match change {
                    Ok(change) if change.key == CLOSE_ON_SPAM_KEY => {
                        let enabled = close_on_spam_from(change.new_value.as_ref());
                        tracing::info!(enabled, "closeOnSpam changed");
                        self.registry.apply_close_on_spam(enabled);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "settings change feed lagged, reloading");
                        self.reload_close_on_spam().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("coordinator stopped");
    }

    async fn reload_close_on_spam(&mut self) {
        let enabled = match self.store.get(CLOSE_ON_SPAM_KEY).await {
            Ok(value) => close_on_spam_from(value.as_ref()),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read closeOnSpam, using default");
                true
            }
        };
        self.registry.apply_close_on_spam(enabled);
    }
}
