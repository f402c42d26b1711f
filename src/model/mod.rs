use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Tab id the browser reports for contexts that are not inside a tab.
pub const TAB_ID_NONE: i64 = -1;

pub const CONTENT_CHANNEL: &str = "content";
pub const POPUP_CHANNEL: &str = "popup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(i64);

impl TabId {
    pub fn new(raw: i64) -> Option<Self> {
        (raw != TAB_ID_NONE).then_some(Self(raw))
    }

    /// Lenient integer parse: JSON numbers are truncated, strings may carry
    /// trailing garbage after a leading integer (`"12px"` is 12).
    pub fn parse(value: &Value) -> Option<Self> {
        let raw = match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i
                } else {
                    let f = n.as_f64()?;
                    if !f.is_finite() || f.abs() >= i64::MAX as f64 {
                        return None;
                    }
                    f.trunc() as i64
                }
            }
            Value::String(s) => parse_leading_int(s)?,
            _ => return None,
        };
        Self::new(raw)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FrameId(pub i64);

impl FrameId {
    pub const MAIN: FrameId = FrameId(0);
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Popup key, handed out in increasing order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PopupKey(pub u64);

impl fmt::Display for PopupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity a connecting peer declares about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderInfo {
    pub tab: Option<TabId>,
    pub frame: FrameId,
}

/// Returns the `cmd` field of an inbound message, or `None` when the message
/// is not an object or the command is missing, empty or not a string.
pub fn command_of(message: &Value) -> Option<&str> {
    message
        .get("cmd")
        .and_then(Value::as_str)
        .filter(|cmd| !cmd.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    AttemptBlocked,
    AllowOnceUsed,
    Injected,
}

impl FrameCommand {
    pub fn parse(message: &Value) -> Option<Self> {
        match command_of(message)? {
            "attempt blocked" => Some(Self::AttemptBlocked),
            "allow once used" => Some(Self::AllowOnceUsed),
            "injected" => Some(Self::Injected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupCommand {
    SetTabId(TabId),
    AllowOnce,
    RevokeAllowOnce,
    SetCloseOnSpam(bool),
}

impl PopupCommand {
    pub fn parse(message: &Value) -> Option<Self> {
        match command_of(message)? {
            "set tab id" => TabId::parse(message.get("id")?).map(Self::SetTabId),
            "allow once" => Some(Self::AllowOnce),
            "revoke allow once" => Some(Self::RevokeAllowOnce),
            "enable close on spam" => Some(Self::SetCloseOnSpam(true)),
            "disable close on spam" => Some(Self::SetCloseOnSpam(false)),
            _ => None,
        }
    }
}

/// Events sent to content frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum FrameEvent {
    #[serde(rename = "allow once")]
    AllowOnce,
    #[serde(rename = "revoke allow once")]
    RevokeAllowOnce,
}

/// Events sent to popups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum PopupEvent {
    #[serde(rename = "init")]
    Init {
        injected: bool,
        #[serde(rename = "allowOnce")]
        allow_once: bool,
        #[serde(rename = "closeOnSpam")]
        close_on_spam: bool,
    },
    #[serde(rename = "allow once")]
    AllowOnce,
    #[serde(rename = "revoke allow once")]
    RevokeAllowOnce,
    #[serde(rename = "enable close on spam")]
    EnableCloseOnSpam,
    #[serde(rename = "disable close on spam")]
    DisableCloseOnSpam,
}

impl PopupEvent {
    pub fn close_on_spam(enabled: bool) -> Self {
        if enabled {
            Self::EnableCloseOnSpam
        } else {
            Self::DisableCloseOnSpam
        }
    }
}
