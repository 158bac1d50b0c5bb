//! WebSocket front end for the relay service.
//!
//! `GET /` answers a plaintext liveness probe; `GET /ws` upgrades to a
//! WebSocket whose text frames carry [`ClientMessage`]/[`ServerMessage`]
//! JSON. Each connection gets a forwarding task that drains its outbox
//! into the socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::service::RelayService;
use crate::config::RelayConfig;

/// Body of the liveness probe.
pub const HEALTH_TEXT: &str = "File Transfer Signaling Server is Running";

/// Errors that stop the relay server.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("relay server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// HTTP routes for a relay service.
pub fn router(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(service)
}

async fn health() -> &'static str {
    HEALTH_TEXT
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(service): State<Arc<RelayService>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

/// Bridges one WebSocket to the relay service until either side closes.
async fn handle_socket(socket: WebSocket, service: Arc<RelayService>) {
    let (id, mut outbox) = service.connect();
    let (mut sink, mut stream) = socket.split();

    // Ends once the service drops this connection's outbox.
    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(conn = %id, error = %e, "Failed to encode relay message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                debug!(conn = %id, "WebSocket send failed, closing");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn = %id, error = %e, "WebSocket receive error");
                break;
            }
        };

        match frame {
            Message::Text(text) => match ClientMessage::from_json(&text) {
                Ok(message) => service.handle(id, message),
                Err(e) => {
                    warn!(conn = %id, error = %e, "Malformed client frame");
                    service.send(id, ServerMessage::Error(format!("malformed message: {e}")));
                }
            },
            Message::Binary(_) => {
                service.send(id, ServerMessage::Error("binary frames are not supported".to_string()));
            }
            Message::Close(_) => break,
            // Ping/pong is answered by axum.
            _ => {}
        }
    }

    service.disconnect(id);
}

/// The relay process: a service plus its HTTP listener and reaper.
#[derive(Debug)]
pub struct RelayServer {
    config: RelayConfig,
    service: Arc<RelayService>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let service = Arc::new(RelayService::new(config.max_members));
        Self { config, service }
    }

    #[inline]
    pub fn service(&self) -> &Arc<RelayService> {
        &self.service
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr = self.config.bind_addr();
        TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })
    }

    /// Serves on an already bound listener until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), RelayError> {
        let local = listener.local_addr()?;
        log_banner(local);

        let reaper = spawn_reaper(
            Arc::clone(&self.service),
            self.config.room_idle(),
            self.config.reap_interval(),
            shutdown.child_token(),
        );

        let signal = shutdown.clone();
        let result = axum::serve(listener, router(Arc::clone(&self.service)))
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        let _ = reaper.await;
        info!("Relay server stopped");
        result.map_err(RelayError::from)
    }

    /// Binds and serves.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }
}

/// Periodically drops rooms that saw no activity for `max_idle`.
pub fn spawn_reaper(
    service: Arc<RelayService>,
    max_idle: Duration,
    period: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = service.reap_idle(max_idle);
                    if reaped > 0 {
                        info!(reaped, rooms = service.room_count(), "Idle rooms reaped");
                    }
                }
            }
        }
        debug!("Room reaper stopped");
    })
}

/// Non-loopback IPv4 addresses with their interface names.
pub fn local_ipv4_addresses() -> Vec<(String, Ipv4Addr)> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(ip) => Some((iface.name, ip)),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate network interfaces");
            Vec::new()
        }
    }
}

fn log_banner(addr: SocketAddr) {
    let port = addr.port();
    info!(%addr, "Signaling server running");
    info!("Local: http://localhost:{port}");
    for (name, ip) in local_ipv4_addresses() {
        info!(interface = %name, "Network: http://{ip}:{port}");
    }
}
