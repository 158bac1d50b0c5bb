//! Links between a session and the relay.
//!
//! A [`RelayConnector`] produces a [`RelayLink`]: the connection id the
//! relay assigned plus a pair of channels carrying [`ClientMessage`]s out
//! and [`ServerMessage`]s in. The session never touches sockets directly,
//! so the same controller runs against a remote relay over WebSocket or an
//! in-process [`RelayService`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use super::error::SessionError;
use crate::relay::{ClientMessage, ConnectionId, RelayService, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established relay connection.
///
/// Dropping the link closes the connection.
#[derive(Debug)]
pub struct RelayLink {
    /// Id the relay assigned to this connection.
    pub id: ConnectionId,
    pub outgoing: mpsc::UnboundedSender<ClientMessage>,
    /// Yields `None` once the relay connection is gone.
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

impl RelayLink {
    pub fn new(
        id: ConnectionId,
        outgoing: mpsc::UnboundedSender<ClientMessage>,
        incoming: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self { id, outgoing, incoming }
    }

    /// Queues a message for the relay. Returns false if the link is down.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.outgoing.send(message).is_ok()
    }
}

/// Opens relay links.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Makes one connection attempt.
    async fn connect(&self) -> Result<RelayLink>;
}

/// Connects to a relay over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    /// `timeout` bounds both the handshake and the wait for `welcome`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: drains the outgoing channel into the socket.
    async fn sender_task(mut write: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<ClientMessage>) {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to encode relay message");
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json)).await {
                debug!(error = %e, "Relay send failed");
                break;
            }
        }
        let _ = write.close().await;
        debug!("Relay sender task terminated");
    }

    /// Receiver task: parses frames from the socket into the incoming channel.
    async fn receiver_task(mut read: SplitStream<WsStream>, tx: mpsc::UnboundedSender<ServerMessage>) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Unparseable relay message"),
                },
                Ok(Message::Close(_)) => {
                    info!("Relay closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Relay receive error");
                    break;
                }
            }
        }
        debug!("Relay receiver task terminated");
    }
}

/// Reads frames until the relay's `welcome` arrives.
async fn wait_for_welcome<S>(read: &mut S) -> Result<ConnectionId>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame.context("relay receive failed")? {
            Message::Text(text) => match ServerMessage::from_json(&text) {
                Ok(ServerMessage::Welcome(welcome)) => return Ok(welcome.id),
                Ok(other) => debug!(?other, "Message before welcome ignored"),
                Err(e) => warn!(error = %e, "Unparseable relay message"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    bail!("relay closed the connection before welcome")
}

#[async_trait]
impl RelayConnector for WsConnector {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self) -> Result<RelayLink> {
        let (ws, _) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .context("timed out connecting to relay")?
            .with_context(|| format!("failed to connect to relay at {}", self.url))?;

        let (write, mut read) = ws.split();
        let id = tokio::time::timeout(self.timeout, wait_for_welcome(&mut read))
            .await
            .context("timed out waiting for relay welcome")??;
        info!(conn = %id, "Connected to relay");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::sender_task(write, out_rx));
        tokio::spawn(Self::receiver_task(read, in_tx));

        Ok(RelayLink::new(id, out_tx, in_rx))
    }
}

/// Connects to a relay service running in this process.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    service: Arc<RelayService>,
}

impl LocalConnector {
    pub fn new(service: Arc<RelayService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RelayConnector for LocalConnector {
    async fn connect(&self) -> Result<RelayLink> {
        let (id, mut outbox) = self.service.connect();
        match outbox.try_recv() {
            Ok(ServerMessage::Welcome(welcome)) if welcome.id == id => {}
            other => bail!("relay did not greet connection: {:?}", other),
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                service.handle(id, message);
            }
            service.disconnect(id);
        });

        Ok(RelayLink::new(id, out_tx, outbox))
    }
}

/// Attempts to connect every `interval` until one succeeds or `cutoff`
/// has passed.
pub async fn connect_with_retry(
    connector: &dyn RelayConnector,
    interval: Duration,
    cutoff: Duration,
) -> Result<RelayLink, SessionError> {
    let deadline = Instant::now() + cutoff;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match connector.connect().await {
            Ok(link) => {
                debug!(attempts, conn = %link.id, "Relay link established");
                return Ok(link);
            }
            Err(e) => {
                if Instant::now() + interval > deadline {
                    warn!(attempts, error = %e, "Giving up on relay");
                    return Err(SessionError::discovery(format!(
                        "relay unreachable after {attempts} attempts: {e:#}"
                    )));
                }
                debug!(attempts, error = %e, "Relay connection failed, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}
