//! Control-Signal Channel und WebSocket-Relay
//!
//! - [`ControlTransport`]: Trait für alles, was Signale zustellen kann
//! - [`ControlChannel`]: einmaliges transparentes Wiederholen bei transienten Fehlern
//! - [`WebSocketTransport`]: signierte Umschläge über ein Relay

use super::messages::*;
use crate::call_engine::ChatId;
use crate::crypto::KeyPair;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Abstand der WebSocket-Pings ans Relay
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Timed out waiting for the relay")]
    Timeout,
}

impl SignalingError {
    /// Fehler, bei denen ein zweiter Versuch sinnvoll ist
    pub fn is_transient(&self) -> bool {
        matches!(self, SignalingError::SendFailed(_) | SignalingError::Timeout)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Stellt Signale an eine Gegenstelle zu
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn send(&self, to: &ChatId, message: &SignalMessage) -> Result<(), SignalingError>;
}

/// Sendet Signale mit Retry-Policy
pub struct ControlChannel {
    transport: Arc<dyn ControlTransport>,
    retries: u32,
    retry_delay: Duration,
}

impl ControlChannel {
    pub fn new(transport: Arc<dyn ControlTransport>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            transport,
            retries,
            retry_delay,
        }
    }

    /// Sendet und wiederholt transiente Fehler bis zu `retries` mal
    pub async fn send(&self, to: &ChatId, message: &SignalMessage) -> Result<(), SignalingError> {
        let mut attempt = 0;
        loop {
            match self.transport.send(to, message).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!("Sending {:?} to {} failed ({}), retrying", message, to, err);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    tracing::error!("Sending {:?} to {} failed: {}", message, to, err);
                    return Err(err);
                }
            }
        }
    }

    /// Genau ein Versuch (für Hangup/Cancel)
    pub async fn send_once(&self, to: &ChatId, message: &SignalMessage) -> Result<(), SignalingError> {
        self.transport.send(to, message).await.map_err(|err| {
            tracing::error!("Sending {:?} to {} failed: {}", message, to, err);
            err
        })
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

// ============================================================================
// WEBSOCKET RELAY
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

/// WebSocket-Client für das Signal-Relay
///
/// Ausgehende Signale werden in ein signiertes [`Envelope`] verpackt,
/// eingehende gegen den Public Key des Absenders geprüft.
pub struct WebSocketTransport {
    server_url: Url,
    keypair: Arc<KeyPair>,
    state: Arc<RwLock<ClientState>>,
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_tx: mpsc::Sender<InboundSignal>,
}

impl WebSocketTransport {
    /// Erstellt den Transport; eingehende Signale kommen über den Receiver
    pub fn new(server_url: Url, keypair: Arc<KeyPair>) -> (Self, mpsc::Receiver<InboundSignal>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(100);

        let transport = Self {
            server_url,
            keypair,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Mutex::new(None),
            inbound_tx,
        };
        (transport, inbound_rx)
    }

    /// Eigene ChatId (Public Key)
    pub fn local_id(&self) -> ChatId {
        ChatId::new(self.keypair.public_key_base64())
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit `<server_url>/ws?id=<public key>` und startet Read-, Write-
    /// und Heartbeat-Task
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let mut ws_url = self
            .server_url
            .join("ws")
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        ws_url
            .query_pairs_mut()
            .append_pair("id", &self.keypair.public_key_base64());

        tracing::info!("Connecting to signaling relay: {}", self.server_url);

        let (ws_stream, _) = tokio::time::timeout(Duration::from_secs(10), connect_async(ws_url.as_str()))
            .await
            .map_err(|_| SignalingError::Timeout)?
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(100);
        *self.tx.lock() = Some(tx.clone());
        self.state.write().is_connected = true;

        // Read-Task
        let state = Arc::clone(&self.state);
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Some(signal) = Self::parse_frame(&text) {
                            if inbound_tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signaling relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            state.write().is_connected = false;
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Heartbeat gegen Idle-Timeouts des Relays
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let connected = state.read().is_connected;
                if !connected || tx.send(Message::Ping(Vec::new())).await.is_err() {
                    tracing::debug!("Heartbeat stopped");
                    break;
                }
            }
        });

        Ok(())
    }

    pub fn disconnect(&self) {
        *self.tx.lock() = None;
        self.state.write().is_connected = false;
    }

    /// Baut und signiert einen Umschlag
    fn seal(&self, to: &ChatId, message: &SignalMessage) -> Result<String, SignalingError> {
        let envelope = Envelope {
            from: self.keypair.public_key_base64(),
            to: to.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            message: message.clone(),
            signature: None,
        };

        let mut value = serde_json::to_value(&envelope)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;
        let signature = self.keypair.sign_message(&value);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("signature".to_string(), serde_json::Value::String(signature));
        }

        serde_json::to_string(&value).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Parst und prüft einen eingehenden Frame; ungültige werden verworfen
    fn parse_frame(text: &str) -> Option<InboundSignal> {
        let frame = match serde_json::from_str::<RelayFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping unparsable relay frame: {}", e);
                return None;
            }
        };

        match frame {
            RelayFrame::Envelope(envelope) => {
                if let Err(e) = Self::verify(&envelope) {
                    tracing::warn!("Dropping envelope from {}: {}", envelope.from, e);
                    return None;
                }
                Some(InboundSignal::Message {
                    from: ChatId::new(envelope.from),
                    message: envelope.message,
                })
            }
            RelayFrame::Notice(RelayNotice::PeerOffline { peer }) => Some(InboundSignal::Unreachable {
                peer: ChatId::new(peer),
            }),
            RelayFrame::Notice(RelayNotice::Error { code, message }) => {
                tracing::error!("Relay error {}: {}", code, message);
                None
            }
            RelayFrame::Notice(RelayNotice::Pong) => None,
        }
    }

    fn verify(envelope: &Envelope) -> Result<(), SignalingError> {
        let signature = envelope
            .signature
            .as_deref()
            .ok_or_else(|| SignalingError::InvalidMessage("missing signature".to_string()))?;
        let value = serde_json::to_value(envelope)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))?;

        KeyPair::verify_message(&envelope.from, &value, signature)
            .map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }
}

#[async_trait]
impl ControlTransport for WebSocketTransport {
    async fn send(&self, to: &ChatId, message: &SignalMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let tx = self.tx.lock().clone().ok_or(SignalingError::NotConnected)?;
        let frame = self.seal(to, message)?;

        tx.send(Message::Text(frame))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Schlägt die ersten `failures` Sendungen mit `error` fehl
    struct FlakyTransport {
        failures: u32,
        error: SignalingError,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ControlTransport for FlakyTransport {
        async fn send(&self, _to: &ChatId, _message: &SignalMessage) -> Result<(), SignalingError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn channel(failures: u32, error: SignalingError) -> (ControlChannel, Arc<FlakyTransport>) {
        let transport = Arc::new(FlakyTransport {
            failures,
            error,
            attempts: AtomicU32::new(0),
        });
        (
            ControlChannel::new(transport.clone(), 1, Duration::ZERO),
            transport,
        )
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let (channel, transport) = channel(1, SignalingError::SendFailed("blip".into()));
        channel.send(&"bob".into(), &SignalMessage::Ringing).await.unwrap();
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_transient_failure_reported() {
        let (channel, transport) = channel(2, SignalingError::Timeout);
        assert!(channel.send(&"bob".into(), &SignalMessage::Ringing).await.is_err());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let (channel, transport) = channel(1, SignalingError::PeerUnreachable("bob".into()));
        assert!(channel.send(&"bob".into(), &SignalMessage::Ringing).await.is_err());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_once_never_retries() {
        let (channel, transport) = channel(1, SignalingError::SendFailed("blip".into()));
        assert!(channel.send_once(&"bob".into(), &SignalMessage::Hangup).await.is_err());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sealed_envelope_verifies() {
        let keypair = Arc::new(KeyPair::generate());
        let (transport, _rx) =
            WebSocketTransport::new(Url::parse("wss://relay.example.org").unwrap(), keypair.clone());

        let frame = transport
            .seal(&"bob".into(), &SignalMessage::Control { control: CallControl::Pause })
            .unwrap();

        match WebSocketTransport::parse_frame(&frame) {
            Some(InboundSignal::Message { from, message }) => {
                assert_eq!(from.as_str(), keypair.public_key_base64());
                assert_eq!(message, SignalMessage::Control { control: CallControl::Pause });
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_forged_envelope_dropped() {
        let sender = KeyPair::generate();
        let forger = KeyPair::generate();
        let (transport, _rx) =
            WebSocketTransport::new(Url::parse("wss://relay.example.org").unwrap(), Arc::new(forger));

        let frame = transport.seal(&"bob".into(), &SignalMessage::Hangup).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        value["from"] = serde_json::Value::String(sender.public_key_base64());

        assert!(WebSocketTransport::parse_frame(&value.to_string()).is_none());
    }

    #[test]
    fn test_peer_offline_notice() {
        let signal = WebSocketTransport::parse_frame(r#"{"type":"peer_offline","peer":"bob"}"#);
        assert_eq!(signal, Some(InboundSignal::Unreachable { peer: "bob".into() }));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (transport, _rx) = WebSocketTransport::new(
            Url::parse("wss://relay.example.org").unwrap(),
            Arc::new(KeyPair::generate()),
        );
        let err = transport.send(&"bob".into(), &SignalMessage::Ringing).await.unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }
}
