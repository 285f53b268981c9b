//! Message Types für das Call-Signal-Protokoll
//!
//! Peer-zu-Peer Signale ([`SignalMessage`]) und der signierte Umschlag
//! ([`Envelope`]), in dem sie über das Relay laufen.

use crate::call_engine::ChatId;
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL CONTROL
// ============================================================================

/// Steuersignal für einen laufenden Call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum CallControl {
    /// Gehaltenen Call fortsetzen
    Resume,
    /// Call halten
    Pause,
    /// Call abbrechen bzw. beenden
    Cancel,
    MuteAudio,
    UnmuteAudio,
    /// Gegenstelle soll kein Video mehr senden
    HideVideo,
    /// Gegenstelle soll wieder Video senden
    ShowVideo,
    BitrateChange { audio_kbps: u32 },
}

impl std::fmt::Display for CallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallControl::Resume => write!(f, "resume"),
            CallControl::Pause => write!(f, "pause"),
            CallControl::Cancel => write!(f, "cancel"),
            CallControl::MuteAudio => write!(f, "mute_audio"),
            CallControl::UnmuteAudio => write!(f, "unmute_audio"),
            CallControl::HideVideo => write!(f, "hide_video"),
            CallControl::ShowVideo => write!(f, "show_video"),
            CallControl::BitrateChange { audio_kbps } => {
                write!(f, "bitrate_change({audio_kbps} kbit/s)")
            }
        }
    }
}

// ============================================================================
// PEER SIGNALS
// ============================================================================

/// Alle Signale zwischen zwei Peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Anruf anbieten
    Offer {
        audio: bool,
        video: bool,
        audio_bitrate: u32,
    },

    /// Angerufener wird benachrichtigt
    Ringing,

    /// Anruf angenommen
    Answer { audio: bool, video: bool },

    /// Eigene Medien-Flags haben sich geändert
    Media { audio: bool, video: bool },

    Control { control: CallControl },

    /// Auflegen
    Hangup,

    /// Bereits im Gespräch oder nicht bereit
    Busy,
}

/// Eingehendes Signal, wie es ein Transport an die Engine liefert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Message { from: ChatId, message: SignalMessage },

    /// Relay meldet die Gegenstelle als nicht erreichbar
    Unreachable { peer: ChatId },
}

// ============================================================================
// RELAY ENVELOPE
// ============================================================================

/// Signierter Umschlag für das Relay
///
/// `from` ist der Public Key des Absenders (Base64) und damit dessen ChatId.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    pub message: SignalMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Nachrichten des Relays selbst
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayNotice {
    PeerOffline { peer: String },
    Error { code: i32, message: String },
    Pong,
}

/// Alles, was über den WebSocket hereinkommen kann
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RelayFrame {
    Envelope(Envelope),
    Notice(RelayNotice),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_shape() {
        let json = serde_json::to_value(SignalMessage::Control {
            control: CallControl::BitrateChange { audio_kbps: 32 },
        })
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "type": "control",
                "control": { "control": "bitrate_change", "audio_kbps": 32 }
            })
        );
    }

    #[test]
    fn test_unit_signal_shape() {
        let json = serde_json::to_string(&SignalMessage::Hangup).unwrap();
        assert_eq!(json, r#"{"type":"hangup"}"#);
    }

    #[test]
    fn test_relay_frame_dispatch() {
        let notice: RelayFrame =
            serde_json::from_str(r#"{"type":"peer_offline","peer":"abc"}"#).unwrap();
        assert!(matches!(
            notice,
            RelayFrame::Notice(RelayNotice::PeerOffline { ref peer }) if peer == "abc"
        ));

        let envelope: RelayFrame = serde_json::from_str(
            r#"{"from":"a","to":"b","timestamp":1,"message":{"type":"ringing"},"signature":"sig"}"#,
        )
        .unwrap();
        match envelope {
            RelayFrame::Envelope(env) => {
                assert_eq!(env.message, SignalMessage::Ringing);
                assert_eq!(env.signature.as_deref(), Some("sig"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
