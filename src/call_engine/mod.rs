//! Call Engine Module - Call-Sessions
//!
//! Dieses Modul verwaltet:
//! - Session Registry (ein laufender Call pro Chat)
//! - Call State Machine
//! - Media Pipeline (Kamera, Audio-Routing, Bitrate, Preview)
//! - Engine-Fassade mit Event-Stream

#[cfg(feature = "cpal-backend")]
mod audio;
mod call;
mod engine;
mod error;
mod media;
mod registry;
mod state;

#[cfg(feature = "cpal-backend")]
pub use audio::{CpalDevices, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use call::{Call, CallDirection, CallHandle, CameraPosition, ChatId, EndReason, MediaRoute};
pub use engine::{CallEngine, CallEvent};
pub use error::{CallEngineError, ErrorKind};
pub use media::{
    AudioFrame, AudioLease, CameraLease, DeviceError, FrameSink, MediaDevices, MediaPipeline, VideoFrame,
    VirtualDevices,
};
pub use registry::{CallSlot, SessionRegistry, SharedCall};
pub use state::{CallState, CallTrigger};
