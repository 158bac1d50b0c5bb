//! In-process transport.
//!
//! Adapters created from the same [`MemoryTransportFactory`] can reach each
//! other through a shared switchboard. The initiator's offer signal carries
//! its switchboard token; the responder answers with its own. Once the
//! initiator consumes the answer both ends are bound and report open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{TransportAdapter, TransportError, TransportEvent, TransportEvents, TransportFactory};
use crate::session::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum MemorySignal {
    Offer { token: Uuid },
    Answer { token: Uuid },
}

#[derive(Debug, Clone)]
struct Slot {
    events: TransportEvents,
    open: Arc<AtomicBool>,
}

/// Shared rendezvous table for in-memory adapters.
#[derive(Debug, Default)]
struct Switchboard {
    slots: DashMap<Uuid, Slot>,
}

/// Creates [`MemoryTransport`] adapters that can connect to one another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportFactory {
    switchboard: Arc<Switchboard>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of adapters currently registered.
    pub fn live_adapters(&self) -> usize {
        self.switchboard.slots.len()
    }

    /// Simulates a network failure: every open channel reports closed.
    pub fn sever_all(&self) {
        for entry in self.switchboard.slots.iter() {
            let slot = entry.value();
            if slot.open.swap(false, Ordering::SeqCst) {
                let _ = slot.events.send(TransportEvent::Closed);
            }
        }
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, role: Role, events: TransportEvents) -> Box<dyn TransportAdapter> {
        Box::new(MemoryTransport::new(
            Arc::clone(&self.switchboard),
            role,
            events,
        ))
    }
}

/// One end of an in-memory channel.
#[derive(Debug)]
pub struct MemoryTransport {
    switchboard: Arc<Switchboard>,
    role: Role,
    token: Uuid,
    open: Arc<AtomicBool>,
    events: TransportEvents,
    peer: Option<Slot>,
    closed: bool,
}

impl MemoryTransport {
    fn new(switchboard: Arc<Switchboard>, role: Role, events: TransportEvents) -> Self {
        let token = Uuid::new_v4();
        let open = Arc::new(AtomicBool::new(false));
        switchboard.slots.insert(
            token,
            Slot {
                events: events.clone(),
                open: Arc::clone(&open),
            },
        );

        if role == Role::Initiator {
            let offer = MemorySignal::Offer { token };
            if let Ok(payload) = serde_json::to_value(&offer) {
                let _ = events.send(TransportEvent::Signal(payload));
            }
        }
        debug!(%token, ?role, "Memory transport created");

        Self {
            switchboard,
            role,
            token,
            open,
            events,
            peer: None,
            closed: false,
        }
    }

    fn lookup(&self, token: Uuid) -> Result<Slot, TransportError> {
        self.switchboard
            .slots
            .get(&token)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| TransportError::InvalidSignal(Arc::from(format!("unknown token {token}"))))
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    fn signal(&mut self, payload: Value) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotOpen);
        }
        let signal: MemorySignal = serde_json::from_value(payload)
            .map_err(|e| TransportError::InvalidSignal(Arc::from(e.to_string())))?;

        match (self.role, signal) {
            (Role::Responder, MemorySignal::Offer { token }) => {
                self.peer = Some(self.lookup(token)?);
                let answer = MemorySignal::Answer { token: self.token };
                let payload = serde_json::to_value(&answer)
                    .map_err(|e| TransportError::Failed(Arc::from(e.to_string())))?;
                let _ = self.events.send(TransportEvent::Signal(payload));
                Ok(())
            }
            (Role::Initiator, MemorySignal::Answer { token }) => {
                let peer = self.lookup(token)?;
                self.open.store(true, Ordering::SeqCst);
                peer.open.store(true, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::Open);
                let _ = peer.events.send(TransportEvent::Open);
                self.peer = Some(peer);
                Ok(())
            }
            (role, signal) => {
                warn!(?role, ?signal, "Signal does not fit this role");
                Err(TransportError::InvalidSignal(Arc::from("unexpected signal for role")))
            }
        }
    }

    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let peer = self.peer.as_ref().ok_or(TransportError::NotOpen)?;
        peer.events
            .send(TransportEvent::Data(message))
            .map_err(|_| TransportError::Failed(Arc::from("peer went away")))
    }

    fn is_open(&self) -> bool {
        !self.closed && self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open.store(false, Ordering::SeqCst);
        self.switchboard.slots.remove(&self.token);
        if let Some(peer) = self.peer.take() {
            if peer.open.swap(false, Ordering::SeqCst) {
                let _ = peer.events.send(TransportEvent::Closed);
            }
        }
        debug!(token = %self.token, "Memory transport closed");
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn expect_signal(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Value {
        match rx.try_recv() {
            Ok(TransportEvent::Signal(v)) => v,
            other => panic!("expected signal, got {:?}", other),
        }
    }

    fn connect_pair(
        factory: &MemoryTransportFactory,
    ) -> (
        Box<dyn TransportAdapter>,
        mpsc::UnboundedReceiver<TransportEvent>,
        Box<dyn TransportAdapter>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (itx, mut irx) = mpsc::unbounded_channel();
        let (rtx, mut rrx) = mpsc::unbounded_channel();
        let mut initiator = factory.create(Role::Initiator, itx);
        let mut responder = factory.create(Role::Responder, rtx);

        let offer = expect_signal(&mut irx);
        responder.signal(offer).unwrap();
        let answer = expect_signal(&mut rrx);
        initiator.signal(answer).unwrap();

        assert!(matches!(irx.try_recv(), Ok(TransportEvent::Open)));
        assert!(matches!(rrx.try_recv(), Ok(TransportEvent::Open)));
        (initiator, irx, responder, rrx)
    }

    #[tokio::test]
    async fn test_signal_exchange_opens_both_ends() {
        let factory = MemoryTransportFactory::new();
        let (initiator, _irx, responder, _rrx) = connect_pair(&factory);
        assert!(initiator.is_open());
        assert!(responder.is_open());
        assert_eq!(factory.live_adapters(), 2);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let factory = MemoryTransportFactory::new();
        let (mut initiator, _irx, _responder, mut rrx) = connect_pair(&factory);

        for i in 0..10u8 {
            initiator.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            match rrx.recv().await {
                Some(TransportEvent::Data(b)) => assert_eq!(b.as_ref(), &[i]),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let factory = MemoryTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut responder = factory.create(Role::Responder, tx);
        assert_eq!(
            responder.send(Bytes::from_static(b"x")).await,
            Err(TransportError::NotOpen)
        );
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let factory = MemoryTransportFactory::new();
        let (initiator, _irx, responder, mut rrx) = connect_pair(&factory);
        drop(initiator);
        assert!(matches!(rrx.recv().await, Some(TransportEvent::Closed)));
        assert!(!responder.is_open());
        assert_eq!(factory.live_adapters(), 1);
    }

    #[tokio::test]
    async fn test_sever_all() {
        let factory = MemoryTransportFactory::new();
        let (initiator, mut irx, responder, mut rrx) = connect_pair(&factory);
        factory.sever_all();
        assert!(matches!(irx.recv().await, Some(TransportEvent::Closed)));
        assert!(matches!(rrx.recv().await, Some(TransportEvent::Closed)));
        assert!(!initiator.is_open());
        assert!(!responder.is_open());
    }

    #[test]
    fn test_unknown_or_misrouted_signal() {
        let factory = MemoryTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut responder = factory.create(Role::Responder, tx);

        let bogus = serde_json::json!({"type": "offer", "token": Uuid::new_v4()});
        assert!(matches!(responder.signal(bogus), Err(TransportError::InvalidSignal(_))));

        let answer = serde_json::json!({"type": "answer", "token": Uuid::new_v4()});
        assert!(matches!(responder.signal(answer), Err(TransportError::InvalidSignal(_))));

        assert!(matches!(
            responder.signal(serde_json::json!("garbage")),
            Err(TransportError::InvalidSignal(_))
        ));
    }
}
