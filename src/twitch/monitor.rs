//! Per-channel connection monitor: owns one transport at a time and drives
//! the connect → listen → backoff cycle on a dedicated task.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::client::TransportFactory;
use super::types::{ChannelIdentity, MonitorStatus, ParsedEvent, SystemEventKind};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_STEP_SECONDS: u64 = 5;
const BACKOFF_CAP_SECONDS: u64 = 30;

/// Linear ramp capped at 30s. Kept as-is for behavioral compatibility with
/// existing deployments.
pub(crate) fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_secs(u64::min(
        BACKOFF_CAP_SECONDS,
        BACKOFF_STEP_SECONDS * u64::from(attempts),
    ))
}

/// State shared between the connection task, the transport and status
/// readers. Everything here is atomic so `get_status` never touches the
/// connection task's hot path.
#[derive(Debug, Default)]
pub struct MonitorShared {
    running: AtomicBool,
    connected: AtomicBool,
    reconnect_count: AtomicU32,
    message_count: AtomicU64,
    dropped_events: AtomicU64,
    // Epoch milliseconds; 0 means "never connected".
    connect_time_ms: AtomicI64,
}

impl MonitorShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.connect_time_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn clear_connected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn note_message(&self) {
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Counters live on the transport's connection, so a fresh transport
    /// starts from a clean slate.
    fn reset_connection_stats(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.message_count.store(0, Ordering::SeqCst);
        self.connect_time_ms.store(0, Ordering::SeqCst);
    }

    /// Non-blocking push into the channel's event queue. A stalled consumer
    /// must never stall the listen loop, so a full queue drops the event.
    pub fn forward(&self, events: &mpsc::Sender<ParsedEvent>, event: ParsedEvent) {
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(events.dropped = dropped, "Event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Event queue closed, discarding event");
            }
        }
    }

    fn connect_time(&self) -> Option<DateTime<Utc>> {
        match self.connect_time_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

struct MonitorRuntime {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Monitor {
    identity: ChannelIdentity,
    monitor_id: Uuid,
    shared: Arc<MonitorShared>,
    events: mpsc::Sender<ParsedEvent>,
    factory: Arc<dyn TransportFactory>,
    runtime: Mutex<Option<MonitorRuntime>>,
}

impl Monitor {
    pub fn new(
        identity: ChannelIdentity,
        events: mpsc::Sender<ParsedEvent>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            identity,
            monitor_id: Uuid::new_v4(),
            shared: Arc::new(MonitorShared::default()),
            events,
            factory,
            runtime: Mutex::new(None),
        }
    }

    /// Spawns the connection task and returns immediately. Idempotent:
    /// calling it while the task is alive is a no-op reporting success.
    pub fn start(&self) -> bool {
        let mut runtime = lock_runtime(&self.runtime);
        if let Some(existing) = runtime.as_ref() {
            if !existing.task.is_finished() {
                tracing::debug!(
                    channel.name = %self.identity.channel,
                    monitor.id = %self.monitor_id,
                    "Monitor already running"
                );
                return true;
            }
        }
        *runtime = None;

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.reconnect_count.store(0, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_monitor_loop(
            self.identity.clone(),
            self.monitor_id,
            Arc::clone(&self.shared),
            self.events.clone(),
            Arc::clone(&self.factory),
            shutdown_rx,
        ));
        *runtime = Some(MonitorRuntime {
            shutdown: shutdown_tx,
            task,
        });
        true
    }

    /// Cooperative stop: flips the running flag and fires the shutdown
    /// signal, which abandons any pending read immediately. The returned
    /// handle lets callers wait for the task to actually unwind.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        self.shared.running.store(false, Ordering::SeqCst);
        let mut runtime = lock_runtime(&self.runtime);
        runtime.take().map(|rt| {
            let _ = rt.shutdown.send(());
            rt.task
        })
    }

    /// `stop()` plus a bounded wait for the connection task to exit.
    pub async fn shutdown(&self, wait: Duration) {
        if let Some(task) = self.stop() {
            if tokio::time::timeout(wait, task).await.is_err() {
                tracing::warn!(
                    channel.name = %self.identity.channel,
                    monitor.id = %self.monitor_id,
                    wait = ?wait,
                    "Connection task did not exit within the grace period"
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Lock-free diagnostic snapshot; tolerates slightly stale values.
    pub fn get_status(&self) -> MonitorStatus {
        MonitorStatus {
            channel: self.identity.channel.clone(),
            running: self.shared.is_running(),
            connected: self.shared.is_connected(),
            reconnect_count: self.shared.reconnect_count.load(Ordering::SeqCst),
            message_count: self.shared.message_count.load(Ordering::SeqCst),
            dropped_events: self.shared.dropped_events.load(Ordering::SeqCst),
            connect_time: self.shared.connect_time(),
        }
    }
}

fn lock_runtime(
    runtime: &Mutex<Option<MonitorRuntime>>,
) -> std::sync::MutexGuard<'_, Option<MonitorRuntime>> {
    runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_monitor_loop(
    identity: ChannelIdentity,
    monitor_id: Uuid,
    shared: Arc<MonitorShared>,
    events: mpsc::Sender<ParsedEvent>,
    factory: Arc<dyn TransportFactory>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    tracing::info!(
        channel.name = %identity.channel,
        monitor.id = %monitor_id,
        "Connection task started"
    );

    loop {
        if !shared.is_running() {
            break;
        }

        shared.reset_connection_stats();
        let mut transport = factory.create(&identity, events.clone(), Arc::clone(&shared));

        let connect_result = tokio::select! {
            biased;
            _ = &mut shutdown_rx => None,
            result = transport.connect() => Some(result),
        };
        let Some(connect_result) = connect_result else {
            // Shutdown raced the connection attempt.
            transport.disconnect().await;
            break;
        };

        match connect_result {
            Ok(()) => {
                shared.reconnect_count.store(0, Ordering::SeqCst);
                tracing::info!(
                    channel.name = %identity.channel,
                    monitor.id = %monitor_id,
                    "Connected"
                );
                shared.forward(
                    &events,
                    ParsedEvent::system(
                        &identity.channel,
                        SystemEventKind::Connected,
                        format!("Connected to channel {}", identity.channel),
                    ),
                );

                let stopped = tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => true,
                    _ = transport.listen() => false,
                };
                transport.disconnect().await;
                if stopped || !shared.is_running() {
                    break;
                }

                tracing::warn!(
                    channel.name = %identity.channel,
                    monitor.id = %monitor_id,
                    "Connection dropped"
                );
                shared.forward(
                    &events,
                    ParsedEvent::system(
                        &identity.channel,
                        SystemEventKind::Disconnected,
                        format!("Disconnected from channel {}", identity.channel),
                    ),
                );
                shared.reconnect_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(error) => {
                let attempt = shared.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(
                    channel.name = %identity.channel,
                    monitor.id = %monitor_id,
                    attempt,
                    error = %error,
                    "Connection attempt failed"
                );
                shared.forward(
                    &events,
                    ParsedEvent::system(&identity.channel, SystemEventKind::Error, error.to_string()),
                );
            }
        }

        let attempts = shared.reconnect_count.load(Ordering::SeqCst);
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            tracing::error!(
                channel.name = %identity.channel,
                monitor.id = %monitor_id,
                attempts,
                "Reached maximum reconnect attempts, giving up"
            );
            shared.forward(
                &events,
                ParsedEvent::system(
                    &identity.channel,
                    SystemEventKind::Error,
                    "Connection failed: maximum reconnect attempts reached",
                ),
            );
            shared.running.store(false, Ordering::SeqCst);
            break;
        }

        let delay = backoff_delay(attempts);
        tracing::info!(
            channel.name = %identity.channel,
            monitor.id = %monitor_id,
            attempt = attempts,
            delay_seconds = delay.as_secs(),
            "Reconnecting after backoff"
        );
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.clear_connected();
    tracing::info!(
        channel.name = %identity.channel,
        monitor.id = %monitor_id,
        "Connection task stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::testutil::{ScriptedFactory, ScriptedState};
    use crate::twitch::types::{SystemEvent, SystemEventKind};

    fn identity() -> ChannelIdentity {
        ChannelIdentity::new("testchan", "testlogin", "token")
    }

    fn monitor_with(
        state: Arc<ScriptedState>,
        capacity: usize,
    ) -> (Monitor, mpsc::Receiver<ParsedEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let monitor = Monitor::new(identity(), tx, Arc::new(ScriptedFactory(state)));
        (monitor, rx)
    }

    // The backoff ramp spans tens of virtual seconds under a paused clock,
    // advanced 10ms per iteration.
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain_system_events(rx: &mut mpsc::Receiver<ParsedEvent>) -> Vec<SystemEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ParsedEvent::System(system) = event {
                events.push(system);
            }
        }
        events
    }

    #[test]
    fn backoff_ramps_linearly_and_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(4), Duration::from_secs(20));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(100), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_after_recovering_from_failures() {
        let state = ScriptedState::failing_first(3);
        let (monitor, _rx) = monitor_with(Arc::clone(&state), 64);
        assert!(monitor.start());

        wait_until(|| monitor.get_status().connected).await;

        let status = monitor.get_status();
        assert!(status.running);
        assert_eq!(status.reconnect_count, 0, "counter must reset on success");
        assert_eq!(state.created(), 4, "three failures then one success");

        // Backoff between attempt i and i+1 is min(30, 5i) seconds.
        let connect_times = state.connect_times();
        assert_eq!(connect_times.len(), 4);
        assert_eq!(connect_times[1] - connect_times[0], Duration::from_secs(5));
        assert_eq!(connect_times[2] - connect_times[1], Duration::from_secs(10));
        assert_eq!(connect_times[3] - connect_times[2], Duration::from_secs(15));

        monitor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_after_exactly_five_attempts() {
        let state = ScriptedState::always_failing();
        let (monitor, mut rx) = monitor_with(Arc::clone(&state), 64);
        assert!(monitor.start());

        wait_until(|| !monitor.get_status().running).await;
        // Give the loop time to do a 6th attempt if it (wrongly) wanted one.
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(state.created(), 5, "no sixth attempt");
        let system = drain_system_events(&mut rx);
        let terminal: Vec<_> = system
            .iter()
            .filter(|e| e.kind == SystemEventKind::Error && e.message.contains("maximum"))
            .collect();
        assert_eq!(terminal.len(), 1, "exactly one terminal error event");
        assert!(!monitor.get_status().connected);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let state = ScriptedState::connecting();
        let (monitor, _rx) = monitor_with(state, 64);
        assert!(monitor.start());
        assert!(monitor.start());
        wait_until(|| monitor.get_status().connected).await;
        monitor.shutdown(Duration::from_secs(1)).await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn connected_status_emits_system_event() {
        let state = ScriptedState::connecting();
        let (monitor, mut rx) = monitor_with(state, 64);
        monitor.start();
        wait_until(|| monitor.get_status().connected).await;

        let system = drain_system_events(&mut rx);
        assert!(
            system
                .iter()
                .any(|e| e.kind == SystemEventKind::Connected && e.channel == "testchan")
        );
        monitor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn full_queue_drops_events_instead_of_stalling() {
        let shared = MonitorShared::default();
        let (tx, _rx) = mpsc::channel(1);
        shared.forward(&tx, ParsedEvent::system("c", SystemEventKind::Connected, "a"));
        shared.forward(&tx, ParsedEvent::system("c", SystemEventKind::Connected, "b"));
        assert_eq!(shared.dropped_events.load(Ordering::SeqCst), 1);
    }
}
