use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::auth::normalize_oauth_token;

/// Identity of one monitored channel. Immutable once a Monitor has been
/// constructed with it; a credential refresh means tearing the Monitor down
/// and creating a new one.
#[derive(Clone)]
pub struct ChannelIdentity {
    pub channel: String,
    pub login: String,
    /// Already normalized to the `oauth:`-prefixed form.
    pub token: String,
}

impl ChannelIdentity {
    pub fn new(channel: &str, login: &str, token: &str) -> Self {
        Self {
            channel: channel.trim_start_matches('#').to_lowercase(),
            login: login.to_lowercase(),
            token: normalize_oauth_token(token),
        }
    }
}

impl fmt::Debug for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelIdentity")
            .field("channel", &self.channel)
            .field("login", &self.login)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatEvent {
    pub username: String,
    pub display_name: String,
    pub text: String,
    pub channel: String,
    pub user_id: Option<String>,
    pub color: String,
    pub badges: String,
    pub is_subscriber: bool,
    pub is_mod: bool,
    pub is_vip: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubKind {
    #[serde(rename = "sub")]
    Sub,
    #[serde(rename = "resub")]
    Resub,
    #[serde(rename = "subgift")]
    SubGift,
    #[serde(rename = "submysterygift")]
    MysteryGift,
}

impl SubKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubKind::Sub => "sub",
            SubKind::Resub => "resub",
            SubKind::SubGift => "subgift",
            SubKind::MysteryGift => "submysterygift",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionEvent {
    pub kind: SubKind,
    pub username: String,
    pub display_name: String,
    pub channel: String,
    pub message: String,
    pub months: u32,
    pub plan: String,
    /// Present only for gift subscriptions.
    pub recipient: Option<String>,
    pub recipient_id: Option<String>,
    /// Present only for mystery gifts.
    pub gift_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaidEvent {
    pub username: String,
    pub display_name: String,
    pub viewer_count: u32,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemEventKind {
    Connected,
    Disconnected,
    Error,
}

impl SystemEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEventKind::Connected => "connected",
            SystemEventKind::Disconnected => "disconnected",
            SystemEventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub kind: SystemEventKind,
    pub message: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the pipeline can produce for one channel. Dispatch sites match
/// exhaustively, so adding a variant is a compile-checked change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParsedEvent {
    Chat(ChatEvent),
    Subscription(SubscriptionEvent),
    Raid(RaidEvent),
    System(SystemEvent),
}

impl ParsedEvent {
    pub fn system(channel: &str, kind: SystemEventKind, message: impl Into<String>) -> Self {
        ParsedEvent::System(SystemEvent {
            kind,
            message: message.into(),
            channel: channel.to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn channel(&self) -> &str {
        match self {
            ParsedEvent::Chat(chat) => &chat.channel,
            ParsedEvent::Subscription(sub) => &sub.channel,
            ParsedEvent::Raid(raid) => &raid.channel,
            ParsedEvent::System(system) => &system.channel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Lock-free snapshot of a Monitor, safe to read from any context.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub channel: String,
    pub running: bool,
    pub connected: bool,
    pub reconnect_count: u32,
    pub message_count: u64,
    pub dropped_events: u64,
    pub connect_time: Option<DateTime<Utc>>,
}

/// Registry record fields merged with the live Monitor snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatusReport {
    pub exists: bool,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    pub running: bool,
    pub connected: bool,
    pub reconnect_count: u32,
    pub message_count: u64,
    pub dropped_events: u64,
    pub connect_time: Option<DateTime<Utc>>,
}

impl ConnectionStatusReport {
    pub fn missing(channel: &str) -> Self {
        Self {
            exists: false,
            channel: channel.to_string(),
            user_id: None,
            status: None,
            created_at: None,
            last_activity: None,
            running: false,
            connected: false,
            reconnect_count: 0,
            message_count: 0,
            dropped_events: 0,
            connect_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_normalizes_channel_login_and_token() {
        let identity = ChannelIdentity::new("#StreamerGuy", "StreamerGuy", "abc123");
        assert_eq!(identity.channel, "streamerguy");
        assert_eq!(identity.login, "streamerguy");
        assert_eq!(identity.token, "oauth:abc123");
    }

    #[test]
    fn identity_debug_never_prints_the_token() {
        let identity = ChannelIdentity::new("chan", "login", "supersecret");
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("supersecret"));
    }

    #[test]
    fn sub_kind_serializes_to_msg_id_values() {
        assert_eq!(
            serde_json::to_string(&SubKind::MysteryGift).unwrap(),
            "\"submysterygift\""
        );
        assert_eq!(serde_json::to_string(&SubKind::SubGift).unwrap(), "\"subgift\"");
    }
}
