//! Call-Datenmodell
//!
//! Ein [`Call`] gehört ausschließlich der Session Registry. Aufrufer
//! bekommen nur den [`CallHandle`] und Snapshots des Calls zu sehen.

use super::error::CallEngineError;
use super::state::{CallState, CallTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// IDENTITIES
// ============================================================================

/// Identität eines Chats (Gegenstelle). Wird nur referenziert, nicht besessen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ChatId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaker Handle auf einen Call in der Registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallHandle(Uuid);

impl CallHandle {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallDirection::Outgoing => write!(f, "outgoing"),
            CallDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Audio-Ausgabe: Lautsprecher oder Standardgerät (Hörmuschel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRoute {
    #[default]
    Default,
    Speaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraPosition {
    #[default]
    Front,
    Rear,
}

impl CameraPosition {
    pub fn from_front(front: bool) -> Self {
        if front {
            CameraPosition::Front
        } else {
            CameraPosition::Rear
        }
    }
}

impl std::fmt::Display for CameraPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraPosition::Front => write!(f, "front"),
            CameraPosition::Rear => write!(f, "rear"),
        }
    }
}

/// Warum ein Call beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Lokal aufgelegt oder abgelehnt
    Local,
    /// Gegenstelle hat aufgelegt oder abgebrochen
    Remote,
    /// Gegenstelle ist besetzt
    Busy,
    /// Gegenstelle nicht erreichbar
    Unreachable,
    /// Weder Audio noch Video aktiv
    NoMedia,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Local => write!(f, "local"),
            EndReason::Remote => write!(f, "remote"),
            EndReason::Busy => write!(f, "busy"),
            EndReason::Unreachable => write!(f, "unreachable"),
            EndReason::NoMedia => write!(f, "no_media"),
        }
    }
}

// ============================================================================
// CALL
// ============================================================================

/// Ein Audio/Video-Anruf mit einer Gegenstelle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub handle: CallHandle,
    pub chat: ChatId,
    pub direction: CallDirection,
    pub state: CallState,

    /// Lokales Senden von Audio/Video
    pub audio_enabled: bool,
    pub video_enabled: bool,

    /// Ausgehandelte Audio-Bitrate in kbit/s
    pub audio_bitrate: u32,

    /// Kamera-Override für diesen Call (sonst globaler Default)
    pub camera: Option<CameraPosition>,

    /// Wir wollen Video der Gegenstelle empfangen (HideVideo/ShowVideo)
    pub receiving_video: bool,
    /// Die Gegenstelle hat uns gebeten, kein Video zu senden
    pub sending_video_paused: bool,

    pub peer_audio_enabled: bool,
    pub peer_video_enabled: bool,
    pub peer_audio_muted: bool,
    pub peer_audio_bitrate: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl Call {
    /// Ausgehende Calls starten in `Dialing`, eingehende in `Ringing`
    pub(crate) fn new(
        chat: ChatId,
        direction: CallDirection,
        audio_enabled: bool,
        video_enabled: bool,
        audio_bitrate: u32,
    ) -> Self {
        let state = match direction {
            CallDirection::Outgoing => CallState::Dialing,
            CallDirection::Incoming => CallState::Ringing,
        };

        Self {
            handle: CallHandle::generate(),
            chat,
            direction,
            state,
            audio_enabled,
            video_enabled,
            audio_bitrate,
            camera: None,
            receiving_video: true,
            sending_video_paused: false,
            peer_audio_enabled: false,
            peer_video_enabled: false,
            peer_audio_muted: false,
            peer_audio_bitrate: None,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn has_media(&self) -> bool {
        self.audio_enabled || self.video_enabled
    }

    /// Dauer ab Annahme; `None` wenn nie angenommen
    pub fn duration(&self) -> Option<chrono::Duration> {
        let answered = self.answered_at?;
        let until = self.ended_at.unwrap_or_else(Utc::now);
        Some(until - answered)
    }

    /// Wendet einen Trigger an; bei Fehler bleibt der Zustand unverändert
    pub(crate) fn transition(&mut self, trigger: CallTrigger) -> Result<CallState, CallEngineError> {
        let next = self.state.apply(trigger)?;
        self.state = next;

        match next {
            CallState::Active if self.answered_at.is_none() => self.answered_at = Some(Utc::now()),
            CallState::Ended => self.ended_at = Some(Utc::now()),
            _ => {}
        }

        Ok(next)
    }

    /// Beendet den Call; gibt `false` zurück wenn er schon beendet war
    pub(crate) fn end(&mut self, reason: EndReason) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = CallState::Ended;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_depends_on_direction() {
        let outgoing = Call::new("alice".into(), CallDirection::Outgoing, true, false, 48);
        let incoming = Call::new("bob".into(), CallDirection::Incoming, false, false, 48);

        assert_eq!(outgoing.state, CallState::Dialing);
        assert_eq!(incoming.state, CallState::Ringing);
        assert_ne!(outgoing.handle, incoming.handle);
    }

    #[test]
    fn test_failed_transition_keeps_state() {
        let mut call = Call::new("alice".into(), CallDirection::Outgoing, true, false, 48);
        assert!(call.transition(CallTrigger::Hold).is_err());
        assert_eq!(call.state, CallState::Dialing);
    }

    #[test]
    fn test_answer_and_end_timestamps() {
        let mut call = Call::new("alice".into(), CallDirection::Incoming, true, false, 48);
        assert!(call.duration().is_none());

        call.transition(CallTrigger::Accept).unwrap();
        assert!(call.answered_at.is_some());

        assert!(call.end(EndReason::Local));
        assert!(!call.end(EndReason::Remote));
        assert_eq!(call.end_reason, Some(EndReason::Local));
        assert!(call.duration().unwrap() >= chrono::Duration::zero());
    }
}
