//! Relay signaling over a WebSocket
//!
//! A single long-lived connection to `<base>/ws/v1.0/signaling/<network ID>`
//! carries JSON envelopes in both directions. One I/O task owns the socket;
//! writes are queued to it and inbound signals are queued to readers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{CredentialsCell, Inbox, Signaling};
use crate::config::RelayConfig;
use crate::network::NetworkError;
use crate::protocol::{Credentials, NetworkId, Signal};

/// Envelope types
pub const TYPE_ERROR: u32 = 0;
pub const TYPE_PING: u32 = 1;
pub const TYPE_SIGNAL: u32 = 2;
pub const TYPE_CREDENTIALS: u32 = 3;

/// `From` value of control messages
pub const FROM_SERVER: &str = "Server";

/// Outer JSON message of the relay protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub typ: u32,
    #[serde(rename = "From", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "To", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    pub fn ping() -> Self {
        Self {
            typ: TYPE_PING,
            from: None,
            to: None,
            message: None,
        }
    }

    pub fn signal(signal: &Signal) -> Self {
        Self {
            typ: TYPE_SIGNAL,
            from: None,
            to: Some(signal.network_id.to_string()),
            message: Some(signal.encode()),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Signaling through the relay service
pub struct RelaySignaling {
    network_id: NetworkId,
    outgoing: mpsc::UnboundedSender<Message>,
    inbox: Inbox,
    credentials: Arc<CredentialsCell>,
    closed: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelaySignaling {
    /// Connect and authenticate with the configured bearer token
    pub async fn connect(config: RelayConfig) -> Result<Self, NetworkError> {
        config.validate()?;

        let network_id = config
            .network_id
            .unwrap_or_else(|| rand::thread_rng().gen());
        let url = format!(
            "{}/ws/v1.0/signaling/{}",
            config.url.trim_end_matches('/'),
            network_id
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| NetworkError::InvalidConfig(format!("Invalid URL {}: {}", url, e)))?;
        if !config.token.is_empty() {
            let token = HeaderValue::from_str(&config.token)
                .map_err(|e| NetworkError::InvalidConfig(format!("Invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, token);
        }

        let ws_stream = match connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                return Err(NetworkError::Unauthorized);
            }
            Err(e) => {
                return Err(NetworkError::Signaling(format!("Connect failed: {}", e)));
            }
        };
        info!("Connected to signaling relay as {}", network_id);

        let closed = CancellationToken::new();
        let (inbox_tx, inbox) = Inbox::new(closed.clone());
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let credentials = Arc::new(CredentialsCell::new());

        let task = tokio::spawn(run(
            ws_stream,
            outgoing_rx,
            inbox_tx,
            credentials.clone(),
            closed.clone(),
            config.ping_interval(),
        ));

        Ok(Self {
            network_id,
            outgoing: outgoing_tx,
            inbox,
            credentials,
            closed,
            task: Mutex::new(Some(task)),
        })
    }

    fn queue(&self, envelope: &Envelope) -> Result<(), NetworkError> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::SignalingClosed);
        }
        let json = serde_json::to_string(envelope)?;
        self.outgoing
            .send(Message::Text(json))
            .map_err(|_| NetworkError::SignalingClosed)
    }
}

/// I/O task: owns the socket until close or failure
async fn run(
    ws_stream: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    inbox: mpsc::UnboundedSender<Signal>,
    credentials: Arc<CredentialsCell>,
    closed: CancellationToken,
    ping_interval: Duration,
) {
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                break;
            }
            _ = ping.tick() => {
                let json = match serde_json::to_string(&Envelope::ping()) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode ping: {}", e);
                        break;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Relay ping failed, closing: {}", e);
                    break;
                }
                trace!("Relay ping sent");
            }
            message = outgoing.recv() => {
                let Some(message) = message else {
                    break;
                };
                if let Err(e) = write.send(message).await {
                    warn!("Relay send failed: {}", e);
                    break;
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => handle_text(&text, &inbox, &credentials),
                Some(Ok(Message::Close(frame))) => {
                    info!("Relay closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay receive failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    closed.cancel();
    debug!("Relay I/O task stopped");
}

fn handle_text(text: &str, inbox: &mpsc::UnboundedSender<Signal>, credentials: &CredentialsCell) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Invalid relay message: {}", e);
            return;
        }
    };
    let from_server = envelope.from.as_deref() == Some(FROM_SERVER);

    match envelope.typ {
        TYPE_SIGNAL => {
            let Some(from) = envelope.from.as_deref().and_then(|f| f.parse::<NetworkId>().ok())
            else {
                warn!("Discarding signal with bad sender {:?}", envelope.from);
                return;
            };
            let record = envelope.message.unwrap_or_default();
            match Signal::decode(&record, from) {
                Ok(signal) => {
                    let _ = inbox.send(signal);
                }
                Err(e) => warn!("Discarding signal from {}: {}", from, e),
            }
        }
        _ if !from_server => {
            warn!(
                "Discarding type {} message from {:?}",
                envelope.typ, envelope.from
            );
        }
        TYPE_CREDENTIALS => {
            let value = match envelope.message.as_deref().map(str::trim) {
                None | Some("") | Some("null") => None,
                Some(json) => match serde_json::from_str::<Credentials>(json) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("Invalid credentials from relay: {}", e);
                        return;
                    }
                },
            };
            debug!(
                "Relay credentials received ({} ICE servers)",
                value.as_ref().map_or(0, |c| c.ice_servers.len())
            );
            credentials.set(value);
        }
        TYPE_ERROR => warn!(
            "Relay reported an error: {}",
            envelope.message.as_deref().unwrap_or("")
        ),
        TYPE_PING => trace!("Relay ping received"),
        other => warn!("Unknown relay message type {}", other),
    }
}

#[async_trait]
impl Signaling for RelaySignaling {
    async fn write_signal(&self, signal: &Signal) -> Result<(), NetworkError> {
        self.queue(&Envelope::signal(signal))
    }

    async fn read_signal(&self) -> Result<Signal, NetworkError> {
        self.inbox.recv().await
    }

    async fn credentials(&self) -> Result<Option<Credentials>, NetworkError> {
        self.credentials.get(&self.closed).await
    }

    fn network_id(&self) -> NetworkId {
        self.network_id
    }

    async fn close(&self) {
        self.closed.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Relay signaling {} closed", self.network_id);
        }
    }
}

impl Drop for RelaySignaling {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
