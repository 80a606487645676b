use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{Result as TwitchResult, TwitchError};

const OAUTH_PREFIX: &str = "oauth:";

/// What the platform's account store knows about a user's Twitch binding.
/// Token refresh is the platform's job; by the time this reaches the core the
/// token is expected to be usable.
#[derive(Debug, Clone)]
pub struct ChannelCredentials {
    pub login: String,
    pub access_token: String,
    pub scope: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ChannelCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Credential lookup boundary. Implemented over the platform's user store in
/// production; over static settings for the headless runner and tests.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials_for(&self, user_id: i64) -> TwitchResult<ChannelCredentials>;
}

/// The PASS line wants the `oauth:` scheme; tokens arrive both bare and
/// already prefixed.
pub fn normalize_oauth_token(token: &str) -> String {
    if token.starts_with(OAUTH_PREFIX) {
        token.to_string()
    } else {
        format!("{OAUTH_PREFIX}{token}")
    }
}

/// Single-user provider backed by the settings file.
pub struct StaticCredentials {
    user_id: i64,
    credentials: ChannelCredentials,
}

impl StaticCredentials {
    pub fn new(user_id: i64, login: &str, access_token: &str) -> Self {
        Self {
            user_id,
            credentials: ChannelCredentials {
                login: login.to_lowercase(),
                access_token: access_token.to_string(),
                scope: vec!["chat:read".to_string()],
                expires_at: None,
            },
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials_for(&self, user_id: i64) -> TwitchResult<ChannelCredentials> {
        if user_id == self.user_id {
            Ok(self.credentials.clone())
        } else {
            Err(TwitchError::NotBound(user_id))
        }
    }
}
