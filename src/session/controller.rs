//! The per-endpoint session state machine.
//!
//! Each session runs as one task that owns every piece of its state: the
//! relay link, the current transport adapter, timers and the transfer in
//! progress. Relay deliveries, adapter events, timer firings and user
//! commands are all serialized through a single `select!` loop, so no two
//! events ever race past the same consistency check.
//!
//! Adapter events and timer firings are tagged with the channel generation
//! they belong to. Tearing a channel down bumps the generation, which turns
//! anything still in flight from the old channel into a no-op.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::code::RoomCode;
use super::error::SessionError;
use super::signaling::{connect_with_retry, RelayConnector, RelayLink, WsConnector};
use super::state::{Role, SessionState};
use super::timer::Timer;
use crate::config::SessionConfig;
use crate::relay::{ClientMessage, ConnectionId, RelayedSignal, ServerMessage, SignalEnvelope};
use crate::transfer::{
    ControlMessage, FileMetadata, FileOffer, Frame, ProtocolViolation, ReceivedFile, TransferProgress,
    TransferReceiver, TransferSender,
};
use crate::transport::{TransportAdapter, TransportEvent, TransportFactory};

/// Something the caller should know about.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The initiator's code, to be shown to the other user.
    RoomCreated(RoomCode),
    /// Joined the relay under this connection id.
    RelayConnected(ConnectionId),
    PeerJoined(ConnectionId),
    PeerLeft(ConnectionId),
    Progress(TransferProgress),
    FileSent(FileMetadata),
    FileReceived(ReceivedFile),
    Error(SessionError),
}

#[derive(Debug)]
enum SessionCommand {
    SendFile {
        offer: FileOffer,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Retry {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Close,
}

/// Work posted back to the session by its own background tasks.
#[derive(Debug)]
enum Internal {
    RelayReady {
        attempt: u64,
        result: Result<RelayLink, SessionError>,
    },
    ConnectionTimeout {
        generation: u64,
    },
    HeartbeatTick {
        generation: u64,
    },
}

/// Builds sessions.
///
/// The relay endpoint is fixed at construction; to point at a different
/// relay, build a new controller.
pub struct SessionController {
    config: SessionConfig,
    connector: Arc<dyn RelayConnector>,
    transports: Arc<dyn TransportFactory>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("relay_url", &self.config.relay_url)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// A controller that reaches the relay at `config.relay_url`.
    pub fn new(config: SessionConfig, transports: Arc<dyn TransportFactory>) -> Self {
        let connector = Arc::new(WsConnector::new(config.relay_url.clone(), config.welcome_timeout));
        Self {
            config,
            connector,
            transports,
        }
    }

    /// Uses a custom relay connector instead of the WebSocket one.
    pub fn with_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = connector;
        self
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts an initiator session under a freshly generated code.
    pub fn create_room(&self) -> SessionHandle {
        self.spawn(Role::Initiator, RoomCode::generate())
    }

    /// Starts a responder session for a code the user entered.
    pub fn join_room(&self, code: &str) -> Result<SessionHandle, SessionError> {
        let code = RoomCode::parse(code)?;
        Ok(self.spawn(Role::Responder, code))
    }

    fn spawn(&self, role: Role, code: RoomCode) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let session = Session {
            role,
            code: code.clone(),
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            transports: Arc::clone(&self.transports),
            state: SessionState::Idle,
            state_tx,
            events: event_tx,
            commands: command_rx,
            internal_tx,
            internal_rx,
            relay: None,
            join_attempt: 0,
            joining: None,
            adapter: None,
            adapter_events: None,
            generation: 0,
            connection_timer: None,
            heartbeat_timer: None,
            outgoing: None,
            incoming: TransferReceiver::new(),
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            role,
            code,
            commands: command_tx,
            state: state_rx,
            events: event_rx,
            task: Some(task),
        }
    }
}

/// The caller's side of a running session.
///
/// Dropping the handle shuts the session down.
#[derive(Debug)]
pub struct SessionHandle {
    role: Role,
    code: RoomCode,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    /// The latest state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver that observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Next event, or `None` once the session has shut down.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Starts sending a file over the open channel.
    ///
    /// Resolves once the transfer has started; completion arrives as
    /// [`SessionEvent::FileSent`].
    pub async fn send_file(&self, offer: FileOffer) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::SendFile { offer, reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Opens `path` and sends it.
    pub async fn send_path(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let offer = FileOffer::open(path)
            .await
            .map_err(|e| SessionError::io(format!("{e:#}")))?;
        self.send_file(offer).await
    }

    /// Rejoins the room after the session fell back to idle.
    pub async fn retry(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Retry { reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Shuts the session down and waits for it to finish.
    pub async fn close(mut self) {
        let _ = self.commands.send(SessionCommand::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// State owned by one running session task.
struct Session {
    role: Role,
    code: RoomCode,
    config: SessionConfig,
    connector: Arc<dyn RelayConnector>,
    transports: Arc<dyn TransportFactory>,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    relay: Option<RelayLink>,
    join_attempt: u64,
    joining: Option<Timer>,

    /// At most one adapter is alive at a time.
    adapter: Option<Box<dyn TransportAdapter>>,
    adapter_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    generation: u64,
    connection_timer: Option<Timer>,
    heartbeat_timer: Option<Timer>,

    outgoing: Option<TransferSender>,
    incoming: TransferReceiver,
}

async fn recv_or_pending<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Session {
    #[instrument(name = "session", skip(self), fields(role = %self.role, code = %self.code))]
    async fn run(mut self) {
        if self.role.is_initiator() {
            info!("Room created");
            self.emit(SessionEvent::RoomCreated(self.code.clone()));
        }
        self.begin_join();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                message = recv_or_pending(self.relay.as_mut().map(|link| &mut link.incoming)) => {
                    self.on_relay(message).await;
                }
                event = recv_or_pending(self.adapter_events.as_mut()) => match event {
                    Some(event) => self.on_transport(event).await,
                    None => self.adapter_events = None,
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                _ = std::future::ready(()), if self.outgoing.is_some() => self.pump().await,
            }
        }

        self.teardown_channel();
        self.joining = None;
        self.relay = None;
        info!(state = %self.state, "Session closed");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, error: SessionError) {
        warn!(error = %error, state = %self.state, "Session error");
        self.emit(SessionEvent::Error(error));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "State changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(SessionEvent::StateChanged(state));
    }

    fn local_id(&self) -> Option<ConnectionId> {
        self.relay.as_ref().map(|link| link.id)
    }

    // Relay

    /// Connects to the relay in the background, retrying on a bounded
    /// schedule. The result comes back as [`Internal::RelayReady`].
    fn begin_join(&mut self) {
        self.join_attempt += 1;
        let attempt = self.join_attempt;
        let connector = Arc::clone(&self.connector);
        let tx = self.internal_tx.clone();
        let interval = self.config.join_retry_interval;
        let cutoff = self.config.join_retry_cutoff;

        debug!(attempt, "Connecting to relay");
        self.joining = Some(Timer::spawn(async move {
            let result = connect_with_retry(connector.as_ref(), interval, cutoff).await;
            let _ = tx.send(Internal::RelayReady { attempt, result });
        }));
    }

    fn on_relay_ready(&mut self, link: RelayLink) {
        info!(conn = %link.id, "Relay connected");
        self.emit(SessionEvent::RelayConnected(link.id));
        self.relay = Some(link);
        self.enter_room();
    }

    /// Joins the room. The responder readies its adapter first so it can
    /// answer the offer that the join will trigger.
    fn enter_room(&mut self) {
        match self.role {
            Role::Initiator => {
                self.send_relay(ClientMessage::JoinRoom(self.code.to_string()));
                self.set_state(SessionState::AwaitingPeer);
            }
            Role::Responder => {
                self.start_negotiation();
                self.send_relay(ClientMessage::JoinRoom(self.code.to_string()));
            }
        }
    }

    fn send_relay(&self, message: ClientMessage) {
        match &self.relay {
            Some(link) => {
                if !link.send(message) {
                    debug!("Relay link closed, message dropped");
                }
            }
            None => debug!("No relay link, message dropped"),
        }
    }

    async fn on_relay(&mut self, message: Option<ServerMessage>) {
        let Some(message) = message else {
            self.on_relay_lost();
            return;
        };

        match message {
            ServerMessage::Welcome(_) => {}
            ServerMessage::UserConnected(peer) => {
                info!(peer = %peer, "Peer joined room");
                self.emit(SessionEvent::PeerJoined(peer));
                let restart = self.role.is_initiator()
                    && matches!(self.state, SessionState::AwaitingPeer | SessionState::Negotiating);
                if restart {
                    self.start_negotiation();
                }
            }
            ServerMessage::Signal(RelayedSignal { signal, caller_id }) => {
                if Some(caller_id) == self.local_id() {
                    debug!("Ignoring own signal");
                    return;
                }
                match self.adapter.as_mut() {
                    Some(adapter) => {
                        if let Err(e) = adapter.signal(signal) {
                            warn!(error = %e, from = %caller_id, "Adapter rejected signal");
                        }
                    }
                    None => debug!(from = %caller_id, "No adapter for signal, dropped"),
                }
            }
            ServerMessage::PeerLeft(peer) => {
                info!(peer = %peer, "Peer left room");
                self.emit(SessionEvent::PeerLeft(peer));
                if self.state == SessionState::Negotiating {
                    self.fall_back(SessionError::PeerLeft);
                }
            }
            ServerMessage::RoomFull(room) => {
                self.abandon_relay(SessionError::discovery(format!("room {room} is full")));
            }
            ServerMessage::RoomExpired(room) => {
                if self.state.is_connected() {
                    debug!(%room, "Room expired after channel open");
                } else {
                    self.abandon_relay(SessionError::discovery(format!("room {room} expired")));
                }
            }
            ServerMessage::Error(reason) => {
                if self.state.is_connected() {
                    warn!(reason = %reason, "Relay error ignored, channel already open");
                } else {
                    self.abandon_relay(SessionError::discovery(reason));
                }
            }
        }
    }

    /// The relay went away. Irrelevant once the channel is open.
    fn on_relay_lost(&mut self) {
        self.relay = None;
        if self.state.is_connected() {
            debug!("Relay link closed after channel open");
            return;
        }
        self.teardown_channel();
        self.set_state(SessionState::Idle);
        self.fail(SessionError::discovery("relay connection lost"));
    }

    /// Leaves the relay and drops back to idle.
    fn abandon_relay(&mut self, error: SessionError) {
        self.relay = None;
        self.teardown_channel();
        self.set_state(SessionState::Idle);
        self.fail(error);
    }

    // Channel

    /// Replaces any existing adapter with a fresh one and starts the
    /// connection timer.
    fn start_negotiation(&mut self) {
        self.teardown_channel();

        let (tx, rx) = mpsc::unbounded_channel();
        self.adapter = Some(self.transports.create(self.role, tx));
        self.adapter_events = Some(rx);
        self.connection_timer = Some(Timer::once(
            self.config.connection_timeout,
            self.internal_tx.clone(),
            Internal::ConnectionTimeout {
                generation: self.generation,
            },
        ));
        debug!(generation = self.generation, "Negotiation started");
        self.set_state(SessionState::Negotiating);
    }

    /// Drops the adapter, its events and every timer bound to it.
    fn teardown_channel(&mut self) {
        self.generation += 1;
        self.connection_timer = None;
        self.heartbeat_timer = None;
        self.adapter_events = None;
        self.outgoing = None;
        if self.incoming.abandon() {
            debug!("Partial incoming transfer discarded");
        }
        if let Some(mut adapter) = self.adapter.take() {
            adapter.close();
        }
    }

    /// Tears the channel down and returns to the waiting state, unless the
    /// transfer already completed.
    fn fall_back(&mut self, error: SessionError) {
        if self.state.is_terminal() {
            debug!(reason = %error, "Channel ended after completion");
            self.teardown_channel();
            return;
        }
        self.teardown_channel();
        self.set_state(self.role.waiting_state());
        self.fail(error);
    }

    async fn enter_connected(&mut self, via: &'static str) {
        if self.state != SessionState::Negotiating {
            return;
        }
        info!(via, "Channel open");
        self.connection_timer = None;
        self.set_state(SessionState::Connected);

        if let Err(e) = self.send_frame(Frame::Heartbeat).await {
            self.fall_back(e);
            return;
        }
        let generation = self.generation;
        self.heartbeat_timer = Some(Timer::repeat(
            self.config.heartbeat_interval,
            self.config.heartbeat_cutoff,
            self.internal_tx.clone(),
            move || Internal::HeartbeatTick { generation },
        ));
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let adapter = self.adapter.as_mut().ok_or(SessionError::ChannelClosed)?;
        adapter.send(frame.encode()).await.map_err(SessionError::from)
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(signal) => match self.local_id() {
                Some(caller_id) => self.send_relay(ClientMessage::Signal(SignalEnvelope {
                    target: self.code.to_string(),
                    signal,
                    caller_id,
                })),
                None => debug!("No relay link, local signal dropped"),
            },
            TransportEvent::Open => self.enter_connected("open").await,
            TransportEvent::Data(bytes) => match Frame::decode(bytes) {
                Ok(frame) => self.on_frame(frame).await,
                Err(e) => warn!(error = %e, "Undecodable channel message dropped"),
            },
            TransportEvent::Closed => self.fall_back(SessionError::ChannelClosed),
            TransportEvent::Error(reason) => self.fall_back(SessionError::Transport(reason)),
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Heartbeat => {
                trace!("Heartbeat received");
                if self.state == SessionState::Negotiating {
                    self.enter_connected("heartbeat").await;
                }
            }
            Frame::Control(ControlMessage::Metadata(metadata)) => {
                if self.outgoing.is_some() || !self.state.is_connected() || self.state.is_terminal() {
                    warn!(state = %self.state, file_name = %metadata.name, "Unexpected metadata ignored");
                    return;
                }
                let progress = self.incoming.on_metadata(metadata);
                self.heartbeat_timer = None;
                self.set_state(SessionState::Transferring);
                self.emit(SessionEvent::Progress(progress));
            }
            Frame::Chunk(chunk) => {
                if self.state.is_terminal() {
                    debug!("Chunk after completion ignored");
                    return;
                }
                match self.incoming.on_chunk(chunk) {
                    Ok(progress) => self.emit(SessionEvent::Progress(progress)),
                    Err(violation) => self.abort_transfer(violation),
                }
            }
            Frame::Control(ControlMessage::Complete) => {
                if self.state.is_terminal() {
                    debug!("Completion after completion ignored");
                    return;
                }
                match self.incoming.on_complete() {
                    Ok(file) => {
                        info!(file_name = %file.name(), size = file.size(), "File received");
                        self.set_state(SessionState::Completed);
                        self.emit(SessionEvent::FileReceived(file));
                    }
                    Err(violation) => self.abort_transfer(violation),
                }
            }
        }
    }

    /// Drops the current transfer but keeps the channel.
    fn abort_transfer(&mut self, violation: ProtocolViolation) {
        self.incoming.abandon();
        self.outgoing = None;
        if self.state == SessionState::Transferring {
            self.set_state(SessionState::Connected);
        }
        self.fail(SessionError::ProtocolViolation(violation));
    }

    // Timers

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RelayReady { attempt, result } => {
                if attempt != self.join_attempt {
                    return;
                }
                self.joining = None;
                match result {
                    Ok(link) => self.on_relay_ready(link),
                    Err(e) => {
                        self.set_state(SessionState::Idle);
                        self.fail(e);
                    }
                }
            }
            Internal::ConnectionTimeout { generation } => {
                if generation != self.generation || self.state != SessionState::Negotiating {
                    return;
                }
                self.fall_back(SessionError::NegotiationTimeout(self.config.connection_timeout));
            }
            Internal::HeartbeatTick { generation } => {
                if generation != self.generation || self.state != SessionState::Connected {
                    return;
                }
                let open = self.adapter.as_ref().is_some_and(|a| a.is_open());
                if open {
                    if let Err(e) = self.send_frame(Frame::Heartbeat).await {
                        debug!(error = %e, "Heartbeat send failed");
                    }
                }
            }
        }
    }

    // Commands

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendFile { offer, reply } => {
                let result = self.start_send(offer).await;
                let _ = reply.send(result);
            }
            SessionCommand::Retry { reply } => {
                let result = self.retry();
                let _ = reply.send(result);
            }
            SessionCommand::Close => {}
        }
    }

    fn retry(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle || self.joining.is_some() {
            return Err(SessionError::InvalidState {
                action: "retry",
                state: self.state,
            });
        }
        info!("Retrying");
        if self.relay.is_some() {
            self.enter_room();
        } else {
            self.begin_join();
        }
        Ok(())
    }

    async fn start_send(&mut self, offer: FileOffer) -> Result<(), SessionError> {
        if !self.state.can_transfer() {
            return Err(SessionError::InvalidState {
                action: "send a file",
                state: self.state,
            });
        }
        if !self.adapter.as_ref().is_some_and(|a| a.is_open()) {
            return Err(SessionError::ChannelClosed);
        }

        let sender = TransferSender::new(offer);
        let metadata = sender.metadata_frame();
        let progress = sender.progress().clone();
        if let Err(e) = self.send_frame(metadata).await {
            self.fall_back(e.clone());
            return Err(e);
        }

        self.heartbeat_timer = None;
        self.outgoing = Some(sender);
        self.set_state(SessionState::Transferring);
        self.emit(SessionEvent::Progress(progress));
        Ok(())
    }

    /// Sends the next chunk, or the completion message once the source is
    /// exhausted. Only one chunk is in flight at a time.
    async fn pump(&mut self) {
        let Some(sender) = self.outgoing.as_mut() else {
            return;
        };

        let next = sender.next_chunk().await;
        match next {
            Ok(Some(chunk)) => {
                let len = chunk.len();
                if let Err(e) = self.send_frame(Frame::Chunk(chunk)).await {
                    self.fall_back(e);
                    return;
                }
                if let Some(sender) = self.outgoing.as_mut() {
                    let progress = sender.record_sent(len);
                    self.emit(SessionEvent::Progress(progress));
                }
            }
            Ok(None) => self.finish_send().await,
            Err(e) => {
                warn!(error = %e, "Reading outgoing file failed");
                self.abort_send(SessionError::io(e.to_string())).await;
            }
        }
    }

    async fn finish_send(&mut self) {
        let Some(sender) = self.outgoing.take() else {
            return;
        };
        let metadata = sender.metadata().clone();
        let sent = sender.progress().transferred_bytes;

        if let Err(e) = self.send_frame(Frame::complete()).await {
            self.fall_back(e);
            return;
        }
        if sent != metadata.size {
            // The peer sees a short completion and rejects it on its side.
            self.abort_send(SessionError::io(format!(
                "source ended after {sent} of {} bytes",
                metadata.size
            )))
            .await;
            return;
        }

        info!(file_name = %metadata.name, size = sent, "File sent");
        self.set_state(SessionState::Completed);
        self.emit(SessionEvent::FileSent(metadata));
    }

    /// Gives up on the outgoing file and returns to connected.
    async fn abort_send(&mut self, error: SessionError) {
        if self.outgoing.take().is_some() {
            // A completion short of the advertised size makes the receiver
            // discard what it has.
            if let Err(e) = self.send_frame(Frame::complete()).await {
                debug!(error = %e, "Could not signal aborted transfer");
            }
        }
        if self.state == SessionState::Transferring {
            self.set_state(SessionState::Connected);
        }
        self.fail(error);
    }
}
