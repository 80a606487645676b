use crate::error::{ConfigError, Result as AppResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::fmt;

fn default_queue_capacity() -> usize {
    256
}

fn default_inactive_timeout_minutes() -> i64 {
    60
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct LiveSettings {
    /// Capacity of each channel's event queue; overflow drops events rather
    /// than stalling the listen loop.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_inactive_timeout_minutes")]
    pub inactive_timeout_minutes: i64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            inactive_timeout_minutes: default_inactive_timeout_minutes(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

#[derive(Deserialize)]
pub struct TwitchSettings {
    pub user_id: i64,
    pub login: String,
    pub access_token: String,
    /// Defaults to the bound login when unset.
    #[serde(default)]
    pub channel: Option<String>,
}

impl fmt::Debug for TwitchSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitchSettings")
            .field("user_id", &self.user_id)
            .field("login", &self.login)
            .field("access_token", &"<redacted>")
            .field("channel", &self.channel)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub live: LiveSettings,
    pub twitch: TwitchSettings,
}

pub fn load_settings() -> AppResult<AppSettings> {
    let settings = Config::builder()
        .add_source(
            Environment::with_prefix("LIVECAST")
                .separator("__")
                .try_parsing(true),
        )
        .add_source(File::with_name("config").required(false))
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    if settings.twitch.login.trim().is_empty() {
        return Err(ConfigError::Missing("twitch.login".to_string()).into());
    }
    if settings.twitch.access_token.trim().is_empty() {
        return Err(ConfigError::Missing("twitch.access_token".to_string()).into());
    }
    Ok(settings)
}
