//! Call State Machine
//!
//! Zustände eines Anrufs und die erlaubten Übergänge:
//!
//! ```text
//! Dialing -> Ringing -> Active <-> OnHold
//!    |          |         |          |
//!    +----------+---------+----------+--> Ended
//! ```
//!
//! Die Tabelle in [`CallState::next`] ist vollständig: alles, was dort
//! nicht steht, ist ein ungültiger Übergang.

use super::error::CallEngineError;
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Ausgehender Anruf wird aufgebaut
    Dialing,
    /// Gegenstelle klingelt (ausgehend) oder Anruf wartet auf Antwort (eingehend)
    Ringing,
    /// Anruf aktiv
    Active,
    /// Anruf gehalten
    OnHold,
    /// Anruf beendet
    Ended,
}

impl CallState {
    pub const ALL: [CallState; 5] = [
        CallState::Dialing,
        CallState::Ringing,
        CallState::Active,
        CallState::OnHold,
        CallState::Ended,
    ];

    /// `Ended` ist der einzige Endzustand
    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }

    /// Active oder OnHold: Medien sind ausgehandelt
    pub fn is_in_progress(self) -> bool {
        matches!(self, CallState::Active | CallState::OnHold)
    }

    /// Übergangstabelle
    pub fn next(self, trigger: CallTrigger) -> Option<CallState> {
        use CallState::*;
        use CallTrigger::*;

        match (self, trigger) {
            (Dialing, PeerRinging) => Some(Ringing),
            (Ringing, Accept) => Some(Active),
            (Active, Hold) => Some(OnHold),
            (OnHold, Resume) => Some(Active),
            (Ended, _) => None,
            (_, End) => Some(Ended),
            _ => None,
        }
    }

    /// Wie [`CallState::next`], aber mit Fehler statt `None`
    pub fn apply(self, trigger: CallTrigger) -> Result<CallState, CallEngineError> {
        self.next(trigger)
            .ok_or_else(|| CallEngineError::transition(self, trigger))
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Dialing => write!(f, "dialing"),
            CallState::Ringing => write!(f, "ringing"),
            CallState::Active => write!(f, "active"),
            CallState::OnHold => write!(f, "on_hold"),
            CallState::Ended => write!(f, "ended"),
        }
    }
}

// ============================================================================
// TRIGGERS
// ============================================================================

/// Auslöser für einen Zustandswechsel (lokale Aktion oder Signal der Gegenstelle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallTrigger {
    PeerRinging,
    Accept,
    Hold,
    Resume,
    End,
}

impl CallTrigger {
    pub const ALL: [CallTrigger; 5] = [
        CallTrigger::PeerRinging,
        CallTrigger::Accept,
        CallTrigger::Hold,
        CallTrigger::Resume,
        CallTrigger::End,
    ];
}

impl std::fmt::Display for CallTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallTrigger::PeerRinging => write!(f, "peer_ringing"),
            CallTrigger::Accept => write!(f, "accept"),
            CallTrigger::Hold => write!(f, "hold"),
            CallTrigger::Resume => write!(f, "resume"),
            CallTrigger::End => write!(f, "end"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
