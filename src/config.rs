//! Configuration for the relay server and the session controller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use once_cell::sync::OnceCell;

use crate::relay::DEFAULT_MAX_MEMBERS;

/// Default relay listening port.
pub const DEFAULT_PORT: u16 = 3001;

/// Relay endpoint a session uses unless told otherwise.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:3001/ws";

/// Cached download directory path
static DOWNLOAD_DIR_CACHE: OnceCell<PathBuf> = OnceCell::new();

/// Relay server settings.
#[derive(Debug, Clone, Parser)]
#[command(name = "relaydrop", version, about = "Rendezvous relay for direct file transfer")]
pub struct RelayConfig {
    /// Address to bind.
    #[arg(long, env = "RELAY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on.
    #[arg(long, short, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum members per room.
    #[arg(long, env = "RELAY_MAX_MEMBERS", default_value_t = DEFAULT_MAX_MEMBERS)]
    pub max_members: usize,

    /// Seconds without activity before a room is dropped.
    #[arg(long, env = "RELAY_ROOM_IDLE_SECS", default_value_t = 600)]
    pub room_idle_secs: u64,

    /// Seconds between idle-room sweeps.
    #[arg(long, env = "RELAY_REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_members: DEFAULT_MAX_MEMBERS,
            room_idle_secs: 600,
            reap_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    #[inline]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[inline]
    pub fn room_idle(&self) -> Duration {
        Duration::from_secs(self.room_idle_secs)
    }

    /// Sweep interval, never zero.
    #[inline]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Session controller settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the relay.
    pub relay_url: String,
    /// Time allowed between entering negotiation and channel open.
    pub connection_timeout: Duration,
    /// Heartbeat cadence after the channel opens.
    pub heartbeat_interval: Duration,
    /// How long heartbeats keep repeating.
    pub heartbeat_cutoff: Duration,
    /// Delay between relay connection attempts.
    pub join_retry_interval: Duration,
    /// Give up connecting to the relay after this long.
    pub join_retry_cutoff: Duration,
    /// How long to wait for the relay's welcome after connecting.
    pub welcome_timeout: Duration,
}

impl Default for SessionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            connection_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_cutoff: Duration::from_secs(10),
            join_retry_interval: Duration::from_millis(500),
            join_retry_cutoff: Duration::from_secs(10),
            welcome_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Defaults pointed at a different relay.
    pub fn with_relay_url(url: impl Into<String>) -> Self {
        Self {
            relay_url: url.into(),
            ..Self::default()
        }
    }
}

/// Where received files go by default (cached).
///
/// The platform download directory, else `~/Downloads`, else the
/// working directory.
pub fn default_download_dir() -> PathBuf {
    DOWNLOAD_DIR_CACHE
        .get_or_init(|| {
            dirs::download_dir()
                .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
                .unwrap_or_else(|| PathBuf::from("."))
        })
        .clone()
}
