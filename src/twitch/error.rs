use thiserror::Error;

#[derive(Debug, Error)]
pub enum TwitchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("TLS setup error: {0}")]
    Tls(String),
    #[error("No Twitch account bound for user {0}")]
    NotBound(i64),
    #[error("Twitch token for user {0} has expired")]
    TokenExpired(i64),
}

pub type Result<T, E = TwitchError> = std::result::Result<T, E>;
