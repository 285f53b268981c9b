//! Session Registry
//!
//! Besitzt alle Calls. Erzeugen und Entfernen laufen unter einem kurzen
//! globalen Lock; Zustandswechsel eines Calls nur unter dessen eigenem
//! Lock, damit verschiedene Calls parallel arbeiten können.
//!
//! Lock-Reihenfolge: niemals den Registry-Lock nehmen, während ein
//! Call-Lock gehalten wird.

use super::call::{Call, CallDirection, CallHandle, ChatId};
use super::error::CallEngineError;
use super::media::{AudioLease, CameraLease};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// CALL SLOT
// ============================================================================

/// Ein Call plus die Ressourcen, die er gerade hält
#[derive(Debug)]
pub struct CallSlot {
    pub(crate) call: Call,
    pub(crate) camera: Option<CameraLease>,
    pub(crate) audio: Option<AudioLease>,
}

impl CallSlot {
    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn holds_camera(&self) -> bool {
        self.camera.is_some()
    }

    pub fn holds_audio(&self) -> bool {
        self.audio.is_some()
    }
}

pub type SharedCall = Arc<Mutex<CallSlot>>;

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Default)]
struct Inner {
    calls: HashMap<CallHandle, SharedCall>,
    /// Nur nicht beendete Calls belegen ihren Chat
    live_by_chat: HashMap<ChatId, CallHandle>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Legt einen neuen Call an; schlägt fehl wenn der Chat schon einen hat
    pub fn create(
        &self,
        chat: ChatId,
        direction: CallDirection,
        audio_enabled: bool,
        video_enabled: bool,
        audio_bitrate: u32,
    ) -> Result<SharedCall, CallEngineError> {
        let mut inner = self.inner.lock();

        if inner.live_by_chat.contains_key(&chat) {
            return Err(CallEngineError::DuplicateCall(chat.to_string()));
        }

        let call = Call::new(chat.clone(), direction, audio_enabled, video_enabled, audio_bitrate);
        let handle = call.handle;
        let shared = Arc::new(Mutex::new(CallSlot {
            call,
            camera: None,
            audio: None,
        }));

        inner.live_by_chat.insert(chat, handle);
        inner.calls.insert(handle, Arc::clone(&shared));

        Ok(shared)
    }

    pub fn lookup(&self, handle: CallHandle) -> Result<SharedCall, CallEngineError> {
        self.inner
            .lock()
            .calls
            .get(&handle)
            .cloned()
            .ok_or_else(|| CallEngineError::NotFound(handle.to_string()))
    }

    /// Laufender (nicht beendeter) Call eines Chats
    pub fn lookup_chat(&self, chat: &ChatId) -> Option<SharedCall> {
        let inner = self.inner.lock();
        let handle = inner.live_by_chat.get(chat)?;
        inner.calls.get(handle).cloned()
    }

    /// Gibt den Chat nach Ende eines Calls wieder frei
    pub(crate) fn release(&self, handle: CallHandle, chat: &ChatId) {
        let mut inner = self.inner.lock();
        if inner.live_by_chat.get(chat) == Some(&handle) {
            inner.live_by_chat.remove(chat);
        }
    }

    /// Entfernt einen Call, der nie angekündigt wurde (Rollback bei `start_call`)
    pub(crate) fn discard(&self, handle: CallHandle) {
        let mut inner = self.inner.lock();
        inner.live_by_chat.retain(|_, h| *h != handle);
        inner.calls.remove(&handle);
    }

    /// Entfernt einen beendeten Call endgültig
    pub fn remove(&self, handle: CallHandle) -> Result<Call, CallEngineError> {
        let shared = self.lookup(handle)?;

        let call = {
            let slot = shared.lock();
            if !slot.call.state.is_terminal() {
                return Err(CallEngineError::InvalidStateTransition(format!(
                    "call {handle} is {} and cannot be removed before it ended",
                    slot.call.state
                )));
            }
            slot.call.clone()
        };

        self.inner.lock().calls.remove(&handle);
        Ok(call)
    }

    /// Entfernt alle beendeten Calls, gibt die Anzahl zurück
    pub fn purge_ended(&self) -> usize {
        let ended: Vec<CallHandle> = self
            .shared_calls()
            .into_iter()
            .filter_map(|shared| {
                let slot = shared.lock();
                slot.call.state.is_terminal().then_some(slot.call.handle)
            })
            .collect();

        let mut inner = self.inner.lock();
        for handle in &ended {
            inner.calls.remove(handle);
        }
        ended.len()
    }

    /// Snapshots aller Calls, älteste zuerst
    pub fn snapshots(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self
            .shared_calls()
            .into_iter()
            .map(|shared| {
                let call = shared.lock().call.clone();
                call
            })
            .collect();
        calls.sort_by_key(|call| call.created_at);
        calls
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live_by_chat.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hält ein nicht beendeter Call gerade die Kamera?
    pub fn has_active_video(&self) -> bool {
        self.shared_calls().into_iter().any(|shared| {
            let slot = shared.lock();
            !slot.call.state.is_terminal() && slot.camera.is_some()
        })
    }

    /// Kopie der Arcs, damit Call-Locks ohne Registry-Lock genommen werden
    fn shared_calls(&self) -> Vec<SharedCall> {
        self.inner.lock().calls.values().cloned().collect()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("calls", &self.len())
            .field("live", &self.live_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
