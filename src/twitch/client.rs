//! Transport layer: one TLS text-line connection to the Twitch IRC endpoint
//! for one channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, pki_types::ServerName};

use super::error::{Result as TwitchResult, TwitchError};
use super::irc;
use super::monitor::MonitorShared;
use super::types::{ChannelIdentity, ParsedEvent};

pub const IRC_HOST: &str = "irc.chat.twitch.tv";
pub const IRC_PORT: u16 = 6697;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
// Shorter than the server's idle-disconnect window, so a timeout means
// "quiet chat", not "dead connection".
const READ_TIMEOUT: Duration = Duration::from_secs(300);
const KEEPALIVE_PING: &str = "PING :tmi.twitch.tv";

/// One connection attempt's worth of transport. The Monitor creates a fresh
/// one for every attempt and never holds two at once.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> TwitchResult<()>;
    /// Blocks until the connection is gone (EOF, read error, or disconnect).
    async fn listen(&mut self);
    /// Best-effort teardown; never fails.
    async fn disconnect(&mut self);
}

/// Seam for tests and alternative chat backends: the Monitor only ever sees
/// this factory.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        identity: &ChannelIdentity,
        events: mpsc::Sender<ParsedEvent>,
        shared: Arc<MonitorShared>,
    ) -> Box<dyn Transport>;
}

pub struct IrcTransportFactory;

impl TransportFactory for IrcTransportFactory {
    fn create(
        &self,
        identity: &ChannelIdentity,
        events: mpsc::Sender<ParsedEvent>,
        shared: Arc<MonitorShared>,
    ) -> Box<dyn Transport> {
        Box::new(IrcTransport::new(identity.clone(), events, shared))
    }
}

pub struct IrcTransport {
    identity: ChannelIdentity,
    events: mpsc::Sender<ParsedEvent>,
    shared: Arc<MonitorShared>,
    reader: Option<BufReader<ReadHalf<TlsStream<TcpStream>>>>,
    writer: Option<WriteHalf<TlsStream<TcpStream>>>,
}

impl IrcTransport {
    pub fn new(
        identity: ChannelIdentity,
        events: mpsc::Sender<ParsedEvent>,
        shared: Arc<MonitorShared>,
    ) -> Self {
        Self {
            identity,
            events,
            shared,
            reader: None,
            writer: None,
        }
    }

    async fn send_raw(
        writer: &mut WriteHalf<TlsStream<TcpStream>>,
        line: &str,
    ) -> std::io::Result<()> {
        writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        writer.flush().await
    }
}

#[async_trait]
impl Transport for IrcTransport {
    async fn connect(&mut self) -> TwitchResult<()> {
        let address = format!("{IRC_HOST}:{IRC_PORT}");
        tracing::info!(
            channel.name = %self.identity.channel,
            address = %address,
            "Connecting to Twitch IRC"
        );

        let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(TwitchError::Io(error)),
            Err(_) => {
                return Err(TwitchError::Connection(format!(
                    "TCP connect to {address} timed out after {CONNECT_TIMEOUT:?}"
                )));
            }
        };

        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(IRC_HOST)
            .map_err(|e| TwitchError::Tls(format!("Invalid server name {IRC_HOST}: {e}")))?;
        let stream = connector.connect(server_name, tcp).await?;

        let (reader, mut writer) = tokio::io::split(stream);

        // Fire-and-forget login: Twitch does not acknowledge each line, so
        // the handshake is written in one burst and the welcome handled by
        // the read loop like any other traffic.
        Self::send_raw(&mut writer, &format!("PASS {}", self.identity.token)).await?;
        Self::send_raw(&mut writer, &format!("NICK {}", self.identity.login)).await?;
        Self::send_raw(
            &mut writer,
            "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership",
        )
        .await?;
        Self::send_raw(&mut writer, &format!("JOIN #{}", self.identity.channel)).await?;

        self.reader = Some(BufReader::new(reader));
        self.writer = Some(writer);
        self.shared.mark_connected();
        tracing::info!(
            channel.name = %self.identity.channel,
            "Joined #{}",
            self.identity.channel
        );
        Ok(())
    }

    async fn listen(&mut self) {
        let (Some(reader), Some(writer)) = (self.reader.as_mut(), self.writer.as_mut()) else {
            return;
        };

        let mut line = String::new();
        loop {
            line.clear();
            match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(Ok(0)) => {
                    tracing::info!(
                        channel.name = %self.identity.channel,
                        "Connection closed by server (EOF)"
                    );
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    tracing::warn!(
                        channel.name = %self.identity.channel,
                        error = %error,
                        "Read error"
                    );
                    break;
                }
                Err(_) => {
                    // Idle chat, not a dead connection: keep the link warm.
                    if let Err(error) = Self::send_raw(writer, KEEPALIVE_PING).await {
                        tracing::warn!(
                            channel.name = %self.identity.channel,
                            error = %error,
                            "Failed to send keepalive PING"
                        );
                        break;
                    }
                    continue;
                }
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }

            if let Some(payload) = trimmed.strip_prefix("PING") {
                let payload = payload.trim();
                let pong = if payload.is_empty() {
                    "PONG :tmi.twitch.tv".to_string()
                } else {
                    format!("PONG {payload}")
                };
                if let Err(error) = Self::send_raw(writer, &pong).await {
                    tracing::warn!(
                        channel.name = %self.identity.channel,
                        error = %error,
                        "Failed to answer server PING"
                    );
                    break;
                }
                continue;
            }

            if let Some(event) = irc::parse_line(trimmed) {
                if matches!(event, ParsedEvent::Chat(_)) {
                    self.shared.note_message();
                }
                self.shared.forward(&self.events, event);
            }
        }

        self.shared.clear_connected();
    }

    async fn disconnect(&mut self) {
        self.shared.clear_connected();
        if let Some(mut writer) = self.writer.take() {
            let _ = Self::send_raw(&mut writer, &format!("PART #{}", self.identity.channel)).await;
            let _ = writer.shutdown().await;
        }
        self.reader = None;
        tracing::debug!(channel.name = %self.identity.channel, "Disconnected");
    }
}
