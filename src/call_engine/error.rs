//! Fehlertypen der Call Engine
//!
//! Jede Operation liefert ein `Result` mit genau einer dieser Fehlerarten
//! plus einer lesbaren Nachricht.

use super::call::CallHandle;
use super::media::DeviceError;
use super::state::{CallState, CallTrigger};
use crate::signaling::SignalingError;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallEngineError {
    #[error("A call already exists for chat {0}")]
    DuplicateCall(String),

    #[error("Call not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Call is not active (state: {0})")]
    CallNotActive(CallState),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device busy: {device} is held by call {owner}")]
    DeviceBusy {
        device: &'static str,
        owner: CallHandle,
    },

    #[error("Unsupported hardware: {0}")]
    UnsupportedHardware(String),

    #[error("Invalid audio bitrate {bitrate} kbit/s (allowed {min}..={max})")]
    InvalidBitrate { bitrate: u32, min: u32, max: u32 },

    #[error("Transport error: {0}")]
    Transport(#[from] SignalingError),

    #[error("Media pipeline is already initialized")]
    AlreadyInitialized,
}

/// Fehlerart ohne Nutzdaten, für `match` auf Aufruferseite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateCall,
    NotFound,
    InvalidStateTransition,
    CallNotActive,
    DeviceUnavailable,
    DeviceBusy,
    UnsupportedHardware,
    InvalidBitrate,
    Transport,
    AlreadyInitialized,
}

impl CallEngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallEngineError::DuplicateCall(_) => ErrorKind::DuplicateCall,
            CallEngineError::NotFound(_) => ErrorKind::NotFound,
            CallEngineError::InvalidStateTransition(_) => ErrorKind::InvalidStateTransition,
            CallEngineError::CallNotActive(_) => ErrorKind::CallNotActive,
            CallEngineError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            CallEngineError::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            CallEngineError::UnsupportedHardware(_) => ErrorKind::UnsupportedHardware,
            CallEngineError::InvalidBitrate { .. } => ErrorKind::InvalidBitrate,
            CallEngineError::Transport(_) => ErrorKind::Transport,
            CallEngineError::AlreadyInitialized => ErrorKind::AlreadyInitialized,
        }
    }

    pub(crate) fn transition(from: CallState, trigger: CallTrigger) -> Self {
        CallEngineError::InvalidStateTransition(format!("cannot {trigger} a call in state {from}"))
    }
}

impl From<DeviceError> for CallEngineError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NoCamera(_) => CallEngineError::UnsupportedHardware(err.to_string()),
            other => CallEngineError::DeviceUnavailable(other.to_string()),
        }
    }
}
