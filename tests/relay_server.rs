//! End-to-end tests against a relay bound to a loopback port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use relaydrop::config::RelayConfig;
use relaydrop::relay::{
    ClientMessage, ConnectionId, RelayServer, RelayService, ServerMessage, SignalEnvelope, HEALTH_TEXT,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    service: Arc<RelayService>,
    shutdown: CancellationToken,
}

impl TestRelay {
    async fn start() -> Self {
        let config = RelayConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..RelayConfig::default()
        };
        let server = RelayServer::new(config);
        let service = Arc::clone(server.service());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(listener, shutdown.clone()));
        Self {
            addr,
            service,
            shutdown,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connects and consumes the welcome.
    async fn client(&self) -> (Client, ConnectionId) {
        let (mut ws, _) = connect_async(self.ws_url()).await.unwrap();
        match next_message(&mut ws).await {
            ServerMessage::Welcome(welcome) => (ws, welcome.id),
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    async fn wait_for_members(&self, room: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.service.members(room).map_or(0, |m| m.len()) != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room never reached expected size");
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn send(ws: &mut Client, message: ClientMessage) {
    ws.send(Message::Text(message.to_json().unwrap())).await.unwrap();
}

async fn next_message(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the socket")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::from_json(&text).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    assert!(
        tokio::time::timeout(Duration::from_millis(200), ws.next()).await.is_err(),
        "unexpected message from relay"
    );
}

/// Two clients in `room`, A joined first.
async fn joined_pair(relay: &TestRelay, room: &str) -> ((Client, ConnectionId), (Client, ConnectionId)) {
    let (mut a, a_id) = relay.client().await;
    let (mut b, b_id) = relay.client().await;
    send(&mut a, ClientMessage::JoinRoom(room.to_string())).await;
    relay.wait_for_members(room, 1).await;
    send(&mut b, ClientMessage::JoinRoom(room.to_string())).await;
    assert_eq!(next_message(&mut a).await, ServerMessage::UserConnected(b_id));
    ((a, a_id), (b, b_id))
}

#[tokio::test]
async fn test_health_probe() {
    let relay = TestRelay::start().await;
    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(HEALTH_TEXT));
}

#[tokio::test]
async fn test_welcome_assigns_distinct_ids() {
    let relay = TestRelay::start().await;
    let (_a, a_id) = relay.client().await;
    let (_b, b_id) = relay.client().await;
    assert_ne!(a_id, b_id);
    assert_eq!(relay.service.connection_count(), 2);
}

#[tokio::test]
async fn test_join_announces_newcomer_only_to_existing_member() {
    let relay = TestRelay::start().await;
    let ((_a, _), (mut b, _)) = joined_pair(&relay, "AB12C3").await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_room_code_is_case_insensitive() {
    let relay = TestRelay::start().await;
    let ((_a, _), (_b, _)) = joined_pair(&relay, "ab12c3").await;
    assert_eq!(relay.service.members("AB12C3").unwrap().len(), 2);
}

#[tokio::test]
async fn test_signal_relayed_without_echo() {
    let relay = TestRelay::start().await;
    let ((mut a, a_id), (mut b, _)) = joined_pair(&relay, "AB12C3").await;

    let payload = json!({"type": "offer", "sdp": "v=0"});
    send(
        &mut a,
        ClientMessage::Signal(SignalEnvelope {
            target: "AB12C3".to_string(),
            signal: payload.clone(),
            // Forged; the relay stamps the real sender.
            caller_id: ConnectionId::new(),
        }),
    )
    .await;

    match next_message(&mut b).await {
        ServerMessage::Signal(relayed) => {
            assert_eq!(relayed.signal, payload);
            assert_eq!(relayed.caller_id, a_id);
        }
        other => panic!("expected signal, got {:?}", other),
    }
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_third_member_gets_room_full() {
    let relay = TestRelay::start().await;
    let ((mut a, _), (_b, _)) = joined_pair(&relay, "AB12C3").await;

    let (mut c, _) = relay.client().await;
    send(&mut c, ClientMessage::JoinRoom("AB12C3".to_string())).await;
    assert!(matches!(next_message(&mut c).await, ServerMessage::RoomFull(room) if room.as_str() == "AB12C3"));
    assert_silent(&mut a).await;
    assert_eq!(relay.service.members("AB12C3").unwrap().len(), 2);
}

#[tokio::test]
async fn test_close_notifies_remaining_member() {
    let relay = TestRelay::start().await;
    let ((mut a, a_id), (mut b, b_id)) = joined_pair(&relay, "AB12C3").await;

    b.close(None).await.unwrap();
    assert_eq!(next_message(&mut a).await, ServerMessage::PeerLeft(b_id));
    relay.wait_for_members("AB12C3", 1).await;
    assert_eq!(relay.service.members("AB12C3").unwrap(), vec![a_id]);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let relay = TestRelay::start().await;
    let (mut a, _) = relay.client().await;

    a.send(Message::Text("not json".to_string())).await.unwrap();
    assert!(matches!(next_message(&mut a).await, ServerMessage::Error(_)));

    a.send(Message::Text(json!({"event": "dance", "data": 1}).to_string()))
        .await
        .unwrap();
    assert!(matches!(next_message(&mut a).await, ServerMessage::Error(_)));

    send(&mut a, ClientMessage::JoinRoom("STILL1".to_string())).await;
    relay.wait_for_members("STILL1", 1).await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let relay = TestRelay::start().await;
    let (mut a, _) = relay.client().await;
    relay.shutdown.cancel();

    // Graceful shutdown waits for open sockets; closing ours lets it finish.
    a.close(None).await.unwrap();
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = a.next().await {}
    })
    .await;
    assert!(rest.is_ok());
}
