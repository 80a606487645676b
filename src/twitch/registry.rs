//! Registry of active channel connections. One record per monitored channel,
//! with a secondary index from user id to channel (at most one active channel
//! per user).
//!
//! Construct one instance at the composition root and hand it around by
//! `Arc`; there is deliberately no global lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::client::TransportFactory;
use super::monitor::Monitor;
use super::types::{
    ChannelIdentity, ConnectionState, ConnectionStatusReport, ParsedEvent,
};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ConnectionRecord {
    pub channel: String,
    pub user_id: i64,
    pub monitor: Arc<Monitor>,
    /// The relay owns the queue; the record only ever observes it.
    pub sink: mpsc::WeakSender<ParsedEvent>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: ConnectionState,
}

impl ConnectionRecord {
    /// True while the relay still holds the receiving end of the queue.
    pub fn sink_attached(&self) -> bool {
        self.sink.upgrade().is_some()
    }
}

struct RegistryInner {
    connections: HashMap<String, ConnectionRecord>,
    user_index: HashMap<i64, String>,
}

pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    factory: Arc<dyn TransportFactory>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: HashMap::new(),
                user_index: HashMap::new(),
            }),
            factory,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers and starts a connection for `identity.channel`. Calling it
    /// again while the channel's Monitor is running is an idempotent
    /// re-attach: the sink reference and activity timestamp are refreshed and
    /// no second Monitor is created.
    pub fn add_connection(
        &self,
        user_id: i64,
        identity: ChannelIdentity,
        sink: &mpsc::Sender<ParsedEvent>,
    ) -> bool {
        let now = Utc::now();
        let channel = identity.channel.clone();
        let mut inner = self.lock();

        if let Some(existing) = inner.connections.get_mut(&channel) {
            if existing.monitor.is_running() {
                tracing::info!(
                    channel.name = %channel,
                    "Channel already has an active connection, re-attaching"
                );
                existing.sink = sink.downgrade();
                existing.last_activity = now;
                return true;
            }
        }

        // Both maps mutate inside this one critical section, so the channel
        // map and user index can never disagree.
        if let Some(stale) = inner.connections.remove(&channel) {
            tracing::debug!(
                channel.name = %channel,
                sink.attached = stale.sink_attached(),
                "Discarding stale connection record"
            );
            stale.monitor.stop();
            inner.user_index.remove(&stale.user_id);
        }

        let monitor = Arc::new(Monitor::new(
            identity,
            sink.clone(),
            Arc::clone(&self.factory),
        ));
        let record = ConnectionRecord {
            channel: channel.clone(),
            user_id,
            monitor: Arc::clone(&monitor),
            sink: sink.downgrade(),
            created_at: now,
            last_activity: now,
            status: ConnectionState::Pending,
        };
        inner.user_index.insert(user_id, channel.clone());
        inner.connections.insert(channel.clone(), record);

        let started = monitor.start();
        if let Some(record) = inner.connections.get_mut(&channel) {
            record.status = if started {
                ConnectionState::Connected
            } else {
                ConnectionState::Error
            };
        }

        if started {
            tracing::info!(channel.name = %channel, user.id = user_id, "Connection added");
        } else {
            // Keep the errored record so status queries can report why.
            tracing::error!(channel.name = %channel, user.id = user_id, "Failed to start monitor");
        }
        started
    }

    /// Removes the channel's record and stops its Monitor, waiting a bounded
    /// time for the connection task to unwind. Returns false if no record
    /// existed.
    pub async fn remove_connection(&self, channel: &str) -> bool {
        let channel = channel.to_lowercase();
        let record = {
            let mut inner = self.lock();
            match inner.connections.remove(&channel) {
                Some(record) => {
                    inner.user_index.remove(&record.user_id);
                    Some(record)
                }
                None => None,
            }
        };

        let Some(record) = record else {
            return false;
        };
        record.monitor.shutdown(STOP_JOIN_TIMEOUT).await;
        tracing::info!(channel.name = %channel, "Connection removed");
        true
    }

    pub fn get_connection(&self, channel: &str) -> Option<ConnectionRecord> {
        self.lock().connections.get(&channel.to_lowercase()).cloned()
    }

    pub fn get_user_connection(&self, user_id: i64) -> Option<ConnectionRecord> {
        let inner = self.lock();
        let channel = inner.user_index.get(&user_id)?;
        inner.connections.get(channel).cloned()
    }

    pub fn update_activity(&self, channel: &str) {
        let mut inner = self.lock();
        if let Some(record) = inner.connections.get_mut(&channel.to_lowercase()) {
            record.last_activity = Utc::now();
        }
    }

    pub fn get_connection_status(&self, channel: &str) -> ConnectionStatusReport {
        match self.get_connection(channel) {
            Some(record) => report_for(&record),
            None => ConnectionStatusReport::missing(channel),
        }
    }

    /// Snapshot of every connection. The records are cloned out of the lock
    /// first so serialization never holds it.
    pub fn all_connections(&self) -> Vec<ConnectionStatusReport> {
        let records: Vec<ConnectionRecord> =
            self.lock().connections.values().cloned().collect();
        records.iter().map(report_for).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Removes records whose last activity is older than the timeout. Meant
    /// to be called on an interval by the composition root.
    pub async fn cleanup_inactive(&self, timeout_minutes: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::minutes(timeout_minutes);
        let stale: Vec<String> = {
            let inner = self.lock();
            inner
                .connections
                .iter()
                .filter(|(_, record)| record.last_activity < cutoff)
                .map(|(channel, _)| channel.clone())
                .collect()
        };

        let mut removed = 0;
        for channel in stale {
            tracing::info!(channel.name = %channel, "Sweeping inactive connection");
            if self.remove_connection(&channel).await {
                removed += 1;
            }
        }
        removed
    }
}

fn report_for(record: &ConnectionRecord) -> ConnectionStatusReport {
    let monitor = record.monitor.get_status();
    // Effective state comes from the live monitor; a stored Error is pinned
    // so callers can see why startup failed.
    let status = if record.status == ConnectionState::Error {
        ConnectionState::Error
    } else if monitor.connected {
        ConnectionState::Connected
    } else if monitor.running {
        ConnectionState::Connecting
    } else {
        ConnectionState::Disconnected
    };
    ConnectionStatusReport {
        exists: true,
        // The monitor's channel is the same string the record is keyed by.
        channel: monitor.channel,
        user_id: Some(record.user_id),
        status: Some(status),
        created_at: Some(record.created_at),
        last_activity: Some(record.last_activity),
        running: monitor.running,
        connected: monitor.connected,
        reconnect_count: monitor.reconnect_count,
        message_count: monitor.message_count,
        dropped_events: monitor.dropped_events,
        connect_time: monitor.connect_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::testutil::{ScriptedFactory, ScriptedState};

    fn registry_with(state: Arc<ScriptedState>) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(ScriptedFactory(state)))
    }

    fn identity(channel: &str) -> ChannelIdentity {
        ChannelIdentity::new(channel, "somelogin", "token")
    }

    #[tokio::test]
    async fn double_add_is_idempotent_and_keeps_one_monitor() {
        let registry = registry_with(ScriptedState::connecting());
        let (tx, _rx) = mpsc::channel(16);

        assert!(registry.add_connection(7, identity("foo"), &tx));
        let first = registry.get_connection("foo").unwrap();

        assert!(registry.add_connection(7, identity("foo"), &tx));
        assert_eq!(registry.connection_count(), 1);
        let second = registry.get_connection("foo").unwrap();
        assert!(
            Arc::ptr_eq(&first.monitor, &second.monitor),
            "re-attach must not create a second monitor"
        );

        registry.remove_connection("foo").await;
    }

    #[tokio::test]
    async fn remove_keeps_both_maps_consistent() {
        let registry = registry_with(ScriptedState::connecting());
        let (tx, _rx) = mpsc::channel(16);

        registry.add_connection(7, identity("foo"), &tx);
        assert!(registry.get_user_connection(7).is_some());

        assert!(registry.remove_connection("foo").await);
        assert!(registry.get_connection("foo").is_none());
        assert!(registry.get_user_connection(7).is_none());
        assert_eq!(registry.connection_count(), 0);

        assert!(!registry.remove_connection("foo").await);
    }

    #[tokio::test]
    async fn user_lookup_goes_through_the_secondary_index() {
        let registry = registry_with(ScriptedState::connecting());
        let (tx, _rx) = mpsc::channel(16);

        registry.add_connection(7, identity("foo"), &tx);
        let record = registry.get_user_connection(7).unwrap();
        assert_eq!(record.channel, "foo");
        assert_eq!(record.user_id, 7);
        assert!(registry.get_user_connection(99).is_none());
    }

    #[tokio::test]
    async fn status_report_merges_record_and_monitor_fields() {
        let registry = registry_with(ScriptedState::connecting());
        let (tx, _rx) = mpsc::channel(16);

        registry.add_connection(7, identity("Foo"), &tx);
        // Channel keys are lowercased on the way in.
        let report = registry.get_connection_status("FOO");
        assert!(report.exists);
        assert_eq!(report.channel, "foo");
        assert_eq!(report.user_id, Some(7));
        assert!(report.running);

        let missing = registry.get_connection_status("nosuch");
        assert!(!missing.exists);
        assert_eq!(missing.user_id, None);

        registry.remove_connection("foo").await;
    }

    #[tokio::test]
    async fn inactive_connections_are_swept() {
        let registry = registry_with(ScriptedState::connecting());
        let (tx, _rx) = mpsc::channel(16);

        registry.add_connection(7, identity("idlechan"), &tx);
        registry.add_connection(8, identity("busychan"), &tx);
        {
            let mut inner = registry.lock();
            if let Some(record) = inner.connections.get_mut("idlechan") {
                record.last_activity = Utc::now() - chrono::Duration::minutes(120);
            }
        }

        assert_eq!(registry.cleanup_inactive(60).await, 1);
        assert!(registry.get_connection("idlechan").is_none());
        assert!(registry.get_user_connection(7).is_none());
        assert!(registry.get_connection("busychan").is_some());

        registry.remove_connection("busychan").await;
    }
}
