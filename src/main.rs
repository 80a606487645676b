use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod live;
mod twitch;

use crate::config::load_settings;
use crate::error::{AppError, Result as AppResult};
use crate::live::{LiveService, PushSink, SinkError};
use crate::twitch::auth::StaticCredentials;
use crate::twitch::client::IrcTransportFactory;
use crate::twitch::registry::ConnectionRegistry;

/// Push sink that writes every outward event to the log. Stands in for the
/// platform's real-time push layer when running headless.
struct LogSink;

#[async_trait::async_trait]
impl PushSink for LogSink {
    async fn emit(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SinkError> {
        tracing::info!(room = %room, event = %event, payload = %payload, "Event");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_PKG_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = load_settings()?;
    tracing::info!(
        user.id = settings.twitch.user_id,
        login = %settings.twitch.login,
        "Configuration loaded"
    );

    let registry = Arc::new(ConnectionRegistry::new(Arc::new(IrcTransportFactory)));
    let credentials = Arc::new(StaticCredentials::new(
        settings.twitch.user_id,
        &settings.twitch.login,
        &settings.twitch.access_token,
    ));
    let service = Arc::new(LiveService::new(
        Arc::clone(&registry),
        credentials,
        Arc::new(LogSink),
        settings.live.queue_capacity,
    ));

    // Periodic sweep of idle connections.
    let sweep_registry = Arc::clone(&registry);
    let sweep_interval = Duration::from_secs(settings.live.sweep_interval_seconds);
    let inactive_timeout = settings.live.inactive_timeout_minutes;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            let removed = sweep_registry.cleanup_inactive(inactive_timeout).await;
            if removed > 0 {
                tracing::info!(connections.removed = removed, "Swept inactive connections");
            }
            tracing::debug!(
                connections.active = sweep_registry.connection_count(),
                "Sweep pass complete"
            );
            for report in sweep_registry.all_connections() {
                tracing::debug!(
                    channel.name = %report.channel,
                    user.id = report.user_id.unwrap_or_default(),
                    status = ?report.status,
                    connected = report.connected,
                    created_at = ?report.created_at,
                    last_activity = ?report.last_activity,
                    connect_time = ?report.connect_time,
                    events.dropped = report.dropped_events,
                    "Active connection"
                );
            }
        }
    });

    let user_id = settings.twitch.user_id;
    let started = service
        .start_live(user_id, settings.twitch.channel.as_deref())
        .await;
    if !started.success {
        tracing::error!(
            error = started.error.unwrap_or_default(),
            message = %started.message,
            "Failed to start live monitoring"
        );
        return Err(AppError::Live(started.message));
    }
    tracing::info!(
        channel.name = started.channel.as_deref().unwrap_or_default(),
        status = started.status.unwrap_or_default(),
        "Live monitoring started. Press Ctrl-C to stop"
    );

    // Status heartbeat so a headless run shows signs of life.
    let status_service = Arc::clone(&service);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let status = status_service.get_status(user_id);
            tracing::info!(
                running = status.running,
                connected = status.connected,
                channel.name = status.channel.as_deref().unwrap_or_default(),
                messages = status.message_count,
                reconnects = status.reconnect_count,
                started_at = ?status.started_at,
                "Status"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let stopped = service.stop_live(user_id).await;
    tracing::info!(message = %stopped.message, "Done");
    Ok(())
}
