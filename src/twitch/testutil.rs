//! Scripted transports for exercising the monitor, registry and live
//! service without a network.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::client::{Transport, TransportFactory};
use super::error::{Result as TwitchResult, TwitchError};
use super::irc;
use super::monitor::MonitorShared;
use super::types::{ChannelIdentity, ParsedEvent};

pub struct ScriptedState {
    /// Fail this many connection attempts before succeeding.
    connect_failures: u32,
    /// Raw protocol lines fed once per successful connect.
    lines: Vec<String>,
    created: AtomicU32,
    connect_times: Mutex<Vec<Instant>>,
}

impl ScriptedState {
    pub fn new(connect_failures: u32, lines: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            connect_failures,
            lines,
            created: AtomicU32::new(0),
            connect_times: Mutex::new(Vec::new()),
        })
    }

    pub fn connecting() -> Arc<Self> {
        Self::new(0, Vec::new())
    }

    pub fn failing_first(failures: u32) -> Arc<Self> {
        Self::new(failures, Vec::new())
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX, Vec::new())
    }

    pub fn with_lines(lines: &[&str]) -> Arc<Self> {
        Self::new(0, lines.iter().map(|l| l.to_string()).collect())
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().unwrap().clone()
    }
}

pub struct ScriptedFactory(pub Arc<ScriptedState>);

impl TransportFactory for ScriptedFactory {
    fn create(
        &self,
        identity: &ChannelIdentity,
        events: mpsc::Sender<ParsedEvent>,
        shared: Arc<MonitorShared>,
    ) -> Box<dyn Transport> {
        let attempt = self.0.created.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(ScriptedTransport {
            state: Arc::clone(&self.0),
            channel: identity.channel.clone(),
            events,
            shared,
            attempt,
        })
    }
}

pub struct ScriptedTransport {
    state: Arc<ScriptedState>,
    channel: String,
    events: mpsc::Sender<ParsedEvent>,
    shared: Arc<MonitorShared>,
    attempt: u32,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> TwitchResult<()> {
        self.state.connect_times.lock().unwrap().push(Instant::now());
        if self.attempt <= self.state.connect_failures {
            return Err(TwitchError::Connection(format!(
                "scripted failure on attempt {} for #{}",
                self.attempt, self.channel
            )));
        }
        self.shared.mark_connected();
        Ok(())
    }

    async fn listen(&mut self) {
        for line in &self.state.lines {
            if let Some(event) = irc::parse_line(line) {
                if matches!(event, ParsedEvent::Chat(_)) {
                    self.shared.note_message();
                }
                self.shared.forward(&self.events, event);
            }
        }
        // Stay "connected" until the monitor shuts us down.
        std::future::pending::<()>().await;
    }

    async fn disconnect(&mut self) {
        self.shared.clear_connected();
    }
}
