//! Two sessions meeting through a real relay and moving a file.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use relaydrop::config::{RelayConfig, SessionConfig};
use relaydrop::relay::{RelayServer, RelayService};
use relaydrop::session::{LocalConnector, SessionController, SessionError, SessionEvent, SessionHandle, SessionState};
use relaydrop::transfer::{FileMetadata, FileOffer, TransferDirection};
use relaydrop::transport::MemoryTransportFactory;

struct Fixture {
    service: Arc<RelayService>,
    transports: MemoryTransportFactory,
    controller: SessionController,
    shutdown: CancellationToken,
}

impl Fixture {
    /// Relay on a loopback port, sessions reaching it over WebSocket.
    async fn over_websocket() -> Self {
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

        let transports = MemoryTransportFactory::new();
        let controller = SessionController::new(
            SessionConfig::with_relay_url(format!("ws://{addr}/ws")),
            Arc::new(transports.clone()),
        );
        Self {
            service,
            transports,
            controller,
            shutdown,
        }
    }

    /// In-process relay; usable with paused time.
    fn in_process() -> Self {
        let service = Arc::new(RelayService::default());
        let transports = MemoryTransportFactory::new();
        let controller = SessionController::new(SessionConfig::default(), Arc::new(transports.clone()))
            .with_connector(Arc::new(LocalConnector::new(Arc::clone(&service))));
        Self {
            service,
            transports,
            controller,
            shutdown: CancellationToken::new(),
        }
    }

    async fn wait_for_room(&self, code: &str) {
        while self.service.members(code).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn connected_pair(&self) -> (SessionHandle, SessionHandle) {
        let mut sender = self.controller.create_room();
        until_state(&mut sender, SessionState::AwaitingPeer).await;
        self.wait_for_room(sender.code().as_str()).await;

        let mut receiver = self
            .controller
            .join_room(&sender.code().as_str().to_lowercase())
            .unwrap();
        until_state(&mut sender, SessionState::Connected).await;
        until_state(&mut receiver, SessionState::Connected).await;
        (sender, receiver)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn until_state(handle: &mut SessionHandle, state: SessionState) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), handle.next_event())
            .await
            .expect("timed out waiting for state")
            .expect("session ended");
        let done = matches!(event, SessionEvent::StateChanged(s) if s == state);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn next_matching<T>(handle: &mut SessionHandle, mut pick: impl FnMut(SessionEvent) -> Option<T>) -> T {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), handle.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("session ended");
        if let Some(found) = pick(event) {
            return found;
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn test_file_moves_between_sessions_over_websocket_relay() {
    let fixture = Fixture::over_websocket().await;
    let (mut sender, mut receiver) = fixture.connected_pair().await;

    let data = pattern(50_000);
    sender
        .send_file(FileOffer::from_bytes("photo.jpg", "image/jpeg", Bytes::from(data.clone())))
        .await
        .unwrap();

    let events = until_state(&mut receiver, SessionState::Completed).await;
    let transferred: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress(p) if p.direction == TransferDirection::Receive => Some(p.transferred_bytes),
            _ => None,
        })
        .collect();
    assert_eq!(transferred, vec![0, 16_384, 32_768, 49_152, 50_000]);

    let file = next_matching(&mut receiver, |e| match e {
        SessionEvent::FileReceived(file) => Some(file),
        _ => None,
    })
    .await;
    assert_eq!(file.name(), "photo.jpg");
    assert_eq!(file.metadata.mime_type, "image/jpeg");
    assert_eq!(file.data.as_ref(), data.as_slice());

    until_state(&mut sender, SessionState::Completed).await;

    // The relay never carried file bytes; the room only ever held two members.
    assert_eq!(fixture.service.members(sender.code().as_str()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_completed_survives_peer_closing() {
    let fixture = Fixture::over_websocket().await;
    let (mut sender, mut receiver) = fixture.connected_pair().await;

    sender
        .send_file(FileOffer::from_bytes("note.txt", "text/plain", Bytes::from_static(b"hello")))
        .await
        .unwrap();
    until_state(&mut receiver, SessionState::Completed).await;
    until_state(&mut sender, SessionState::Completed).await;

    sender.close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(receiver.state(), SessionState::Completed);
}

#[tokio::test]
async fn test_send_path_and_persist() {
    let fixture = Fixture::over_websocket().await;
    let (mut sender, mut receiver) = fixture.connected_pair().await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("notes.txt");
    tokio::fs::write(&source, b"first line\nsecond line\n").await.unwrap();
    sender.send_path(&source).await.unwrap();

    let file = next_matching(&mut receiver, |e| match e {
        SessionEvent::FileReceived(file) => Some(file),
        _ => None,
    })
    .await;
    assert_eq!(file.metadata.mime_type, "text/plain");

    let dest_dir = tempfile::tempdir().unwrap();
    let dest = file.persist(dest_dir.path().join("inbox")).await.unwrap();
    assert_eq!(dest.file_name().unwrap(), "notes.txt");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"first line\nsecond line\n");

    until_state(&mut sender, SessionState::Completed).await;
}

#[tokio::test]
async fn test_send_path_missing_file_is_io_error() {
    let fixture = Fixture::over_websocket().await;
    let (sender, _receiver) = fixture.connected_pair().await;

    let dir = tempfile::tempdir().unwrap();
    let err = sender.send_path(dir.path().join("absent.bin")).await.unwrap_err();
    assert!(matches!(err, SessionError::Io(_)));
    assert_eq!(sender.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_empty_file_completes_at_full_progress() {
    let fixture = Fixture::in_process();
    let (mut sender, mut receiver) = fixture.connected_pair().await;

    sender
        .send_file(FileOffer::from_bytes("empty", "application/octet-stream", Bytes::new()))
        .await
        .unwrap();

    let file = next_matching(&mut receiver, |e| match e {
        SessionEvent::FileReceived(file) => Some(file),
        _ => None,
    })
    .await;
    assert_eq!(file.size(), 0);

    let sent = next_matching(&mut sender, |e| match e {
        SessionEvent::FileSent(metadata) => Some(metadata),
        _ => None,
    })
    .await;
    assert_eq!(sent.size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_lone_responder_times_out_exactly_once() {
    let fixture = Fixture::in_process();
    let mut receiver = fixture.controller.join_room("NOONE1").unwrap();

    until_state(&mut receiver, SessionState::Idle).await;
    let err = next_matching(&mut receiver, |e| match e {
        SessionEvent::Error(err) => Some(err),
        _ => None,
    })
    .await;
    assert_eq!(err, SessionError::NegotiationTimeout(Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(receiver.try_next_event().is_none());
    assert_eq!(fixture.transports.live_adapters(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_channel_loss_mid_transfer() {
    let fixture = Fixture::in_process();
    let (mut sender, mut receiver) = fixture.connected_pair().await;

    // One chunk is available up front; the rest never arrives.
    let (mut source, reader) = tokio::io::duplex(64 * 1024);
    source.write_all(&pattern(16_384)).await.unwrap();
    let metadata = FileMetadata {
        name: "big.bin".to_string(),
        size: 1 << 20,
        mime_type: "application/octet-stream".to_string(),
    };
    sender.send_file(FileOffer::new(metadata, reader)).await.unwrap();
    until_state(&mut receiver, SessionState::Transferring).await;

    fixture.transports.sever_all();
    until_state(&mut receiver, SessionState::Idle).await;
    assert!(!receiver.state().is_connected());

    // Unblocks the sender's pending read so it notices the dead channel.
    drop(source);
    until_state(&mut sender, SessionState::AwaitingPeer).await;
}
