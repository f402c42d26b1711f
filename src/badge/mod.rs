use crate::model::TabId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeColor {
    DarkRed,
    Green,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Indicator {
    pub background: BadgeColor,
    pub text: String,
}

impl Indicator {
    pub fn counter(value: i64) -> Self {
        let text = if value > 999 {
            "999+".to_string()
        } else {
            value.to_string()
        };
        Self {
            background: BadgeColor::DarkRed,
            text,
        }
    }

    pub fn allowing() -> Self {
        Self {
            background: BadgeColor::Green,
            text: "OFF".to_string(),
        }
    }
}

/// Per-tab visual indicator sink.
pub trait BadgeSink: Send + Sync {
    fn set_indicator(&self, tab: TabId, indicator: Indicator);
    /// Forgets the indicator of a tab that is no longer tracked.
    fn clear(&self, tab: TabId);
}

/// Keeps the last indicator rendered for every tab.
#[derive(Debug, Clone, Default)]
pub struct BadgeBoard {
    current: Arc<Mutex<BTreeMap<TabId, Indicator>>>,
}

impl BadgeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<TabId, Indicator> {
        self.current.lock().unwrap().clone()
    }
}

impl BadgeSink for BadgeBoard {
    fn set_indicator(&self, tab: TabId, indicator: Indicator) {
        tracing::debug!(tab = %tab, text = %indicator.text, background = ?indicator.background, "badge updated");
        self.current.lock().unwrap().insert(tab, indicator);
    }

    fn clear(&self, tab: TabId) {
        if self.current.lock().unwrap().remove(&tab).is_some() {
            tracing::debug!(tab = %tab, "badge cleared");
        }
    }
}
