//! In-Memory Transport
//!
//! Verbindet mehrere Engines im selben Prozess ohne Netzwerk. Fehler
//! lassen sich gezielt einspeisen.

use super::client::{ControlTransport, SignalingError};
use super::messages::{InboundSignal, SignalMessage};
use crate::call_engine::ChatId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

type Peers = Arc<Mutex<HashMap<ChatId, mpsc::Sender<InboundSignal>>>>;

/// Gemeinsames "Netz" für alle Endpunkte
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    peers: Peers,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert einen Endpunkt; eingehende Signale kommen über den Receiver
    pub fn endpoint(&self, id: impl Into<ChatId>) -> (MemoryTransport, mpsc::Receiver<InboundSignal>) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(100);
        self.peers.lock().insert(id.clone(), tx);

        let transport = MemoryTransport {
            local: id,
            peers: Arc::clone(&self.peers),
            failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        };
        (transport, rx)
    }

    /// Nimmt einen Endpunkt vom Netz; Sendungen an ihn schlagen fehl
    pub fn disconnect(&self, id: &ChatId) {
        self.peers.lock().remove(id);
    }
}

pub struct MemoryTransport {
    local: ChatId,
    peers: Peers,
    failures: Mutex<VecDeque<SignalingError>>,
    sent: Mutex<Vec<(ChatId, SignalMessage)>>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &ChatId {
        &self.local
    }

    /// Die nächste Sendung schlägt mit `error` fehl
    pub fn fail_next(&self, error: SignalingError) {
        self.failures.lock().push_back(error);
    }

    /// Alle erfolgreich zugestellten Signale
    pub fn sent(&self) -> Vec<(ChatId, SignalMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ControlTransport for MemoryTransport {
    async fn send(&self, to: &ChatId, message: &SignalMessage) -> Result<(), SignalingError> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let peer = self
            .peers
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| SignalingError::PeerUnreachable(to.to_string()))?;

        peer.send(InboundSignal::Message {
            from: self.local.clone(),
            message: message.clone(),
        })
        .await
        .map_err(|_| SignalingError::PeerUnreachable(to.to_string()))?;

        self.sent.lock().push((to.clone(), message.clone()));
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_between_endpoints() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.endpoint("alice");
        let (_bob, mut bob_rx) = network.endpoint("bob");

        alice.send(&"bob".into(), &SignalMessage::Ringing).await.unwrap();

        assert_eq!(
            bob_rx.recv().await,
            Some(InboundSignal::Message {
                from: "alice".into(),
                message: SignalMessage::Ringing,
            })
        );
        assert_eq!(alice.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_unreachable() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = network.endpoint("alice");

        let err = alice.send(&"carol".into(), &SignalMessage::Hangup).await.unwrap_err();
        assert!(matches!(err, SignalingError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_consumed_once() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = network.endpoint("alice");
        let (_bob, _bob_rx) = network.endpoint("bob");

        alice.fail_next(SignalingError::SendFailed("blip".into()));
        assert!(alice.send(&"bob".into(), &SignalMessage::Ringing).await.is_err());
        assert!(alice.send(&"bob".into(), &SignalMessage::Ringing).await.is_ok());
    }
}
