use super::tab::{TabContext, TabSession};
use crate::model::{PopupCommand, PopupEvent, PopupKey, TabId};
use crate::peer::{post_event, Peer};
use crate::settings::{Debouncer, CLOSE_ON_SPAM_KEY};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Bound(TabId),
}

/// Registry state a popup command may touch.
pub struct PopupContext<'a> {
    pub tabs: &'a mut HashMap<TabId, TabSession>,
    pub tab: TabContext<'a>,
    pub close_on_spam: &'a mut bool,
    pub persist: &'a mut Debouncer,
}

/// Result of a popup command that other popups must see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabFanout {
    pub tab: TabId,
    pub event: PopupEvent,
}

/// One open popup window.
pub struct PopupSession {
    key: PopupKey,
    binding: Binding,
    pipe: Arc<dyn Peer>,
}

impl PopupSession {
    pub fn new(key: PopupKey, pipe: Arc<dyn Peer>) -> Self {
        Self {
            key,
            binding: Binding::Unbound,
            pipe,
        }
    }

    pub fn key(&self) -> PopupKey {
        self.key
    }

    pub fn tab(&self) -> Option<TabId> {
        match self.binding {
            Binding::Unbound => None,
            Binding::Bound(tab) => Some(tab),
        }
    }

    pub fn is_bound_to(&self, tab: TabId) -> bool {
        self.binding == Binding::Bound(tab)
    }

    pub fn post(&self, event: &PopupEvent) {
        post_event(self.pipe.as_ref(), event);
    }

    pub fn on_message(&mut self, message: &Value, ctx: PopupContext<'_>) -> Option<TabFanout> {
        let command = PopupCommand::parse(message)?;

        let tab = match (self.binding, command) {
            (_, PopupCommand::SetTabId(id)) => {
                self.bind(id, &ctx);
                return None;
            }
            (Binding::Unbound, _) => return None,
            (Binding::Bound(tab), _) => tab,
        };

        match command {
            PopupCommand::SetTabId(_) => None,
            PopupCommand::AllowOnce => {
                let session = ctx.tabs.get_mut(&tab)?;
                session.grant_allow_once(&ctx.tab);
                Some(TabFanout {
                    tab,
                    event: PopupEvent::AllowOnce,
                })
            }
            PopupCommand::RevokeAllowOnce => {
                let session = ctx.tabs.get_mut(&tab)?;
                session.revoke_allow_once(&ctx.tab);
                Some(TabFanout {
                    tab,
                    event: PopupEvent::RevokeAllowOnce,
                })
            }
            PopupCommand::SetCloseOnSpam(enabled) => {
                // Popups are confirmed through the settings change feed once
                // the delayed write lands.
                *ctx.close_on_spam = enabled;
                ctx.persist.schedule(CLOSE_ON_SPAM_KEY, Value::Bool(enabled));
                None
            }
        }
    }

    fn bind(&mut self, id: TabId, ctx: &PopupContext<'_>) {
        match self.binding {
            Binding::Bound(current) if current != id => {
                tracing::debug!(popup = %self.key, bound = %current, requested = %id, "ignoring rebind of popup");
                return;
            }
            _ => self.binding = Binding::Bound(id),
        }

        let (injected, allow_once) = match ctx.tabs.get(&id) {
            Some(session) => (true, session.allow_once()),
            None => (false, false),
        };
        self.post(&PopupEvent::Init {
            injected,
            allow_once,
            close_on_spam: *ctx.close_on_spam,
        });
    }

    /// Nothing else to release: a popup never owns tab state.
    pub fn on_disconnect(&self) {
        tracing::debug!(popup = %self.key, "popup disconnected");
    }
}
