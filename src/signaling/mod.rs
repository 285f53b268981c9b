//! Signaling Module - Control-Signal Channel
//!
//! Dieses Modul verwaltet die Signale zwischen zwei Peers:
//! - Angebot, Annahme, Auflegen und Call-Controls
//! - Retry-Policy für transiente Fehler
//! - WebSocket-Relay mit signierten Umschlägen
//! - In-Memory Transport für lokale Verbindungen und Tests

mod client;
mod memory;
mod messages;

pub use client::{ControlChannel, ControlTransport, SignalingError, WebSocketTransport};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::*;
