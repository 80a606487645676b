//! Live service: bridges one user's monitored channel to that user's
//! real-time subscribers through the push collaborator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::twitch::auth::CredentialProvider;
use crate::twitch::registry::ConnectionRegistry;
use crate::twitch::types::{ChannelIdentity, ParsedEvent};

const ROOM_PREFIX: &str = "twitch_";

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Real-time push collaborator: fans `(room, event, payload)` out to the
/// room's subscribers. WebSocket framing and subscriber management live on
/// the other side of this trait.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn emit(&self, room: &str, event: &str, payload: Value) -> Result<(), SinkError>;
}

/// Outcome of a start/stop call, shaped for the platform's API conventions.
#[derive(Debug, Clone, Serialize)]
pub struct LiveActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl LiveActionResult {
    fn ok(message: String, channel: Option<String>, status: Option<&'static str>) -> Self {
        Self {
            success: true,
            message,
            channel,
            status,
            error: None,
        }
    }

    fn failed(message: String, error: &'static str, channel: Option<String>) -> Self {
        Self {
            success: false,
            message,
            channel,
            status: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub running: bool,
    pub channel: Option<String>,
    pub connected: bool,
    pub message_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
}

impl LiveStatus {
    fn not_running() -> Self {
        Self {
            running: false,
            channel: None,
            connected: false,
            message_count: 0,
            started_at: None,
            reconnect_count: 0,
        }
    }
}

struct LiveSession {
    channel: String,
    started_at: DateTime<Utc>,
}

struct RelayHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct LiveInner {
    sessions: HashMap<i64, LiveSession>,
    relays: HashMap<String, RelayHandle>,
}

pub struct LiveService {
    registry: Arc<ConnectionRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn PushSink>,
    queue_capacity: usize,
    inner: Mutex<LiveInner>,
}

impl LiveService {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn PushSink>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            registry,
            credentials,
            sink,
            queue_capacity,
            inner: Mutex::new(LiveInner {
                sessions: HashMap::new(),
                relays: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LiveInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts monitoring for a user. The channel defaults to the user's
    /// bound login. A user who already has a running connection gets an
    /// `already_running` result naming the existing channel instead of a
    /// silent replacement.
    pub async fn start_live(&self, user_id: i64, channel: Option<&str>) -> LiveActionResult {
        let credentials = match self.credentials.credentials_for(user_id).await {
            Ok(credentials) => credentials,
            Err(error) => {
                tracing::warn!(user.id = user_id, error = %error, "Credential lookup failed");
                return LiveActionResult::failed(error.to_string(), "credentials_unavailable", None);
            }
        };
        tracing::debug!(user.id = user_id, scope = ?credentials.scope, "Credentials resolved");
        if credentials.is_expired(Utc::now()) {
            // Refresh is the platform's job; nothing is spawned for a dead token.
            return LiveActionResult::failed(
                crate::twitch::TwitchError::TokenExpired(user_id).to_string(),
                "credentials_expired",
                None,
            );
        }

        if let Some(existing) = self.registry.get_user_connection(user_id) {
            if existing.monitor.is_running() {
                return LiveActionResult {
                    success: true,
                    message: format!("Already monitoring channel {}", existing.channel),
                    channel: Some(existing.channel),
                    status: Some("already_running"),
                    error: None,
                };
            }
        }

        let channel = channel
            .unwrap_or(&credentials.login)
            .trim_start_matches('#')
            .to_lowercase();
        let identity = ChannelIdentity::new(&channel, &credentials.login, &credentials.access_token);

        let (events_tx, events_rx) = mpsc::channel(self.queue_capacity);
        if !self.registry.add_connection(user_id, identity, &events_tx) {
            return LiveActionResult::failed(
                format!("Could not connect to channel {channel}"),
                "connection_failed",
                Some(channel),
            );
        }

        self.spawn_relay(user_id, &channel, events_rx);
        {
            let mut inner = self.lock();
            inner.sessions.insert(
                user_id,
                LiveSession {
                    channel: channel.clone(),
                    started_at: Utc::now(),
                },
            );
        }

        tracing::info!(user.id = user_id, channel.name = %channel, "Live monitoring started");
        LiveActionResult::ok(
            format!("Monitoring channel {channel}"),
            Some(channel),
            Some("started"),
        )
    }

    /// Stops the user's monitoring, if any.
    pub async fn stop_live(&self, user_id: i64) -> LiveActionResult {
        let Some(connection) = self.registry.get_user_connection(user_id) else {
            return LiveActionResult::failed(
                "No live monitoring is running".to_string(),
                "not_running",
                None,
            );
        };
        let channel = connection.channel;

        {
            let mut inner = self.lock();
            if let Some(relay) = inner.relays.remove(&channel) {
                relay.running.store(false, Ordering::SeqCst);
            }
            inner.sessions.remove(&user_id);
        }
        self.registry.remove_connection(&channel).await;

        tracing::info!(user.id = user_id, channel.name = %channel, "Live monitoring stopped");
        LiveActionResult::ok(
            format!("Stopped monitoring channel {channel}"),
            Some(channel),
            None,
        )
    }

    /// Registry status composed with session metadata. A user without a
    /// connection gets the not-running shape, never an error.
    pub fn get_status(&self, user_id: i64) -> LiveStatus {
        let Some(connection) = self.registry.get_user_connection(user_id) else {
            return LiveStatus::not_running();
        };
        let report = self.registry.get_connection_status(&connection.channel);
        if !report.exists {
            // The channel was removed between the two lookups.
            return LiveStatus::not_running();
        }
        // Session metadata only applies while it still describes this channel.
        let started_at = self.lock().sessions.get(&user_id).and_then(|session| {
            (session.channel == connection.channel).then_some(session.started_at)
        });
        LiveStatus {
            running: report.running,
            channel: Some(connection.channel),
            connected: report.connected,
            message_count: report.message_count,
            started_at,
            reconnect_count: report.reconnect_count,
        }
    }

    fn spawn_relay(&self, user_id: i64, channel: &str, mut events_rx: mpsc::Receiver<ParsedEvent>) {
        let running = Arc::new(AtomicBool::new(true));
        let relay_running = Arc::clone(&running);
        let registry = Arc::clone(&self.registry);
        let sink = Arc::clone(&self.sink);
        let room = format!("{ROOM_PREFIX}{user_id}");
        let relay_channel = channel.to_string();

        let task = tokio::spawn(async move {
            tracing::debug!(channel.name = %relay_channel, room = %room, "Relay task started");
            while let Some(event) = events_rx.recv().await {
                if !relay_running.load(Ordering::SeqCst) {
                    break;
                }
                registry.update_activity(event.channel());
                if let ParsedEvent::Chat(chat) = &event {
                    tracing::debug!(
                        channel.name = %chat.channel,
                        user = %chat.display_name,
                        text = %chat.text,
                        "Chat message"
                    );
                }
                let (event_name, payload) = outbound_message(&event);
                // One bad event must not kill the channel's relay.
                if let Err(error) = sink.emit(&room, event_name, payload).await {
                    tracing::warn!(
                        channel.name = %relay_channel,
                        event = event_name,
                        error = %error,
                        "Push sink rejected event"
                    );
                }
            }
            tracing::debug!(channel.name = %relay_channel, "Relay task stopped");
        });

        let mut inner = self.lock();
        if let Some(previous) = inner
            .relays
            .insert(channel.to_string(), RelayHandle { running, task })
        {
            // A replaced relay belongs to an earlier, already-stopped
            // session for this channel.
            previous.running.store(false, Ordering::SeqCst);
            previous.task.abort();
        }
    }
}

/// Event variant → outward message shape. Field names and event names are a
/// compatibility contract with the front-end consumers; do not rearrange.
fn outbound_message(event: &ParsedEvent) -> (&'static str, Value) {
    match event {
        ParsedEvent::Chat(chat) => {
            let username = if chat.display_name.is_empty() {
                &chat.username
            } else {
                &chat.display_name
            };
            (
                "twitch_chat",
                json!({
                    "username": username,
                    "message": chat.text,
                    "user_id": chat.user_id,
                    "color": chat.color,
                    "is_subscriber": chat.is_subscriber,
                    "is_mod": chat.is_mod,
                    "is_vip": chat.is_vip,
                    "badges": chat.badges,
                    "timestamp": chat.timestamp,
                }),
            )
        }
        ParsedEvent::Subscription(sub) => {
            let username = if sub.display_name.is_empty() {
                &sub.username
            } else {
                &sub.display_name
            };
            (
                "twitch_subscription",
                json!({
                    "sub_type": sub.kind.as_str(),
                    "username": username,
                    "months": sub.months,
                    "message": sub.message,
                    "sub_plan": sub.plan,
                    "recipient": sub.recipient,
                    "gift_count": sub.gift_count,
                    "timestamp": sub.timestamp,
                }),
            )
        }
        ParsedEvent::Raid(raid) => {
            let username = if raid.display_name.is_empty() {
                &raid.username
            } else {
                &raid.display_name
            };
            (
                "twitch_raid",
                json!({
                    "username": username,
                    "viewer_count": raid.viewer_count,
                    "timestamp": raid.timestamp,
                }),
            )
        }
        ParsedEvent::System(system) => (
            "twitch_system",
            json!({
                "event": system.kind.as_str(),
                "message": system.message,
                "timestamp": system.timestamp,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::auth::StaticCredentials;
    use crate::twitch::testutil::{ScriptedFactory, ScriptedState};
    use crate::twitch::types::{SubKind, SystemEventKind};
    use std::time::Duration;

    const CHAT_LINE: &str = "@display-name=MikoFan;color=#1E90FF;subscriber=1;mod=0;user-id=42 :mikofan!mikofan@mikofan.tmi.twitch.tv PRIVMSG #foo :first!";

    #[derive(Default)]
    struct RecordingSink {
        emitted: Mutex<Vec<(String, String, Value)>>,
    }

    impl RecordingSink {
        fn emitted(&self) -> Vec<(String, String, Value)> {
            self.emitted.lock().unwrap().clone()
        }

        fn named(&self, event: &str) -> Vec<Value> {
            self.emitted()
                .into_iter()
                .filter(|(_, name, _)| name == event)
                .map(|(_, _, payload)| payload)
                .collect()
        }
    }

    #[async_trait]
    impl PushSink for RecordingSink {
        async fn emit(&self, room: &str, event: &str, payload: Value) -> Result<(), SinkError> {
            self.emitted
                .lock()
                .unwrap()
                .push((room.to_string(), event.to_string(), payload));
            Ok(())
        }
    }

    /// Sink that fails on every emit; the relay must keep going anyway.
    struct RejectingSink(Arc<RecordingSink>);

    #[async_trait]
    impl PushSink for RejectingSink {
        async fn emit(&self, room: &str, event: &str, payload: Value) -> Result<(), SinkError> {
            let _ = self.0.emit(room, event, payload).await;
            Err(SinkError("subscriber layer is down".to_string()))
        }
    }

    fn service_with(
        state: Arc<ScriptedState>,
        sink: Arc<dyn PushSink>,
        user_id: i64,
    ) -> (LiveService, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(ScriptedFactory(state))));
        let service = LiveService::new(
            Arc::clone(&registry),
            Arc::new(StaticCredentials::new(user_id, "foo", "token")),
            sink,
            64,
        );
        (service, registry)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn chat_line_reaches_the_room_and_status_reflects_it() {
        let sink = Arc::new(RecordingSink::default());
        let (service, registry) =
            service_with(ScriptedState::with_lines(&[CHAT_LINE]), sink.clone(), 7);

        let result = service.start_live(7, Some("foo")).await;
        assert!(result.success);
        assert_eq!(result.status, Some("started"));
        assert_eq!(result.channel.as_deref(), Some("foo"));

        wait_until(|| !sink.named("twitch_chat").is_empty()).await;

        let chats = sink.named("twitch_chat");
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0]["username"], "MikoFan");
        assert_eq!(chats[0]["message"], "first!");
        assert_eq!(chats[0]["is_subscriber"], true);
        let emitted = sink.emitted();
        assert_eq!(emitted[0].0, "twitch_7");

        let status = service.get_status(7);
        assert!(status.running);
        assert_eq!(status.channel.as_deref(), Some("foo"));
        assert_eq!(status.message_count, 1);
        assert!(status.started_at.is_some());
        assert_eq!(registry.connection_count(), 1);

        service.stop_live(7).await;
    }

    #[tokio::test]
    async fn stop_live_clears_registry_and_status() {
        let sink = Arc::new(RecordingSink::default());
        let (service, registry) =
            service_with(ScriptedState::with_lines(&[CHAT_LINE]), sink, 7);

        service.start_live(7, Some("foo")).await;
        let stopped = service.stop_live(7).await;
        assert!(stopped.success);
        assert_eq!(stopped.channel.as_deref(), Some("foo"));

        assert!(registry.get_connection("foo").is_none());
        let status = service.get_status(7);
        assert!(!status.running);
        assert_eq!(status.channel, None);

        let again = service.stop_live(7).await;
        assert!(!again.success);
        assert_eq!(again.error, Some("not_running"));
    }

    #[tokio::test]
    async fn second_start_reports_the_existing_channel() {
        let sink = Arc::new(RecordingSink::default());
        let (service, _registry) = service_with(ScriptedState::connecting(), sink, 7);

        service.start_live(7, Some("foo")).await;
        let second = service.start_live(7, Some("bar")).await;
        assert!(second.success);
        assert_eq!(second.status, Some("already_running"));
        assert_eq!(second.channel.as_deref(), Some("foo"));

        service.stop_live(7).await;
    }

    #[tokio::test]
    async fn unknown_user_fails_before_anything_is_spawned() {
        let sink = Arc::new(RecordingSink::default());
        let (service, registry) = service_with(ScriptedState::connecting(), sink, 7);

        let result = service.start_live(99, Some("foo")).await;
        assert!(!result.success);
        assert_eq!(result.error, Some("credentials_unavailable"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn channel_defaults_to_the_bound_login() {
        let sink = Arc::new(RecordingSink::default());
        let (service, registry) = service_with(ScriptedState::connecting(), sink, 7);

        let result = service.start_live(7, None).await;
        assert_eq!(result.channel.as_deref(), Some("foo"));
        assert!(registry.get_connection("foo").is_some());

        service.stop_live(7).await;
    }

    #[tokio::test]
    async fn events_arrive_in_receive_order() {
        let lines = [
            ":a!a@a.tmi.twitch.tv PRIVMSG #foo :one",
            ":b!b@b.tmi.twitch.tv PRIVMSG #foo :two",
            ":c!c@c.tmi.twitch.tv PRIVMSG #foo :three",
        ];
        let sink = Arc::new(RecordingSink::default());
        let (service, _registry) =
            service_with(ScriptedState::with_lines(&lines), sink.clone(), 7);

        service.start_live(7, Some("foo")).await;
        wait_until(|| sink.named("twitch_chat").len() == 3).await;

        let messages: Vec<String> = sink
            .named("twitch_chat")
            .iter()
            .map(|p| p["message"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(messages, ["one", "two", "three"]);

        service.stop_live(7).await;
    }

    #[tokio::test]
    async fn sink_failures_do_not_kill_the_relay() {
        let recorder = Arc::new(RecordingSink::default());
        let lines = [
            ":a!a@a.tmi.twitch.tv PRIVMSG #foo :one",
            ":b!b@b.tmi.twitch.tv PRIVMSG #foo :two",
        ];
        let (service, _registry) = service_with(
            ScriptedState::with_lines(&lines),
            Arc::new(RejectingSink(recorder.clone())),
            7,
        );

        service.start_live(7, Some("foo")).await;
        wait_until(|| recorder.named("twitch_chat").len() == 2).await;

        service.stop_live(7).await;
    }

    #[test]
    fn dispatch_shapes_match_the_frontend_contract() {
        let Some(sub_event) = crate::twitch::irc::parse_line(
            "@msg-id=subgift;login=generous;display-name=Generous;msg-param-sub-plan=1000;msg-param-recipient-display-name=Lucky :tmi.twitch.tv USERNOTICE #foo",
        ) else {
            panic!("expected a subscription event");
        };
        let (name, payload) = outbound_message(&sub_event);
        assert_eq!(name, "twitch_subscription");
        assert_eq!(payload["sub_type"], SubKind::SubGift.as_str());
        assert_eq!(payload["username"], "Generous");
        assert_eq!(payload["recipient"], "Lucky");
        assert_eq!(payload["gift_count"], Value::Null);

        let system = ParsedEvent::system("foo", SystemEventKind::Error, "boom");
        let (name, payload) = outbound_message(&system);
        assert_eq!(name, "twitch_system");
        assert_eq!(payload["event"], "error");
        assert_eq!(payload["message"], "boom");
    }
}
