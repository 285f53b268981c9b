//! Call Engine
//!
//! Fassade über Session Registry, State Machine, Media Pipeline und
//! Control-Signal Channel. Befehle der Anwendung und Signale der
//! Gegenstelle laufen hier zusammen; Ergebnisse gehen als [`CallEvent`]
//! zurück an die Anwendung.
//!
//! Lokaler Zustand ist maßgeblich: Transportfehler werden gemeldet,
//! aber nie zurückgerollt.

use super::call::{Call, CallDirection, CallHandle, CameraPosition, ChatId, EndReason};
use super::error::{CallEngineError, ErrorKind};
use super::media::{AudioFrame, AudioLease, CameraLease, FrameSink, MediaDevices, MediaPipeline, VideoFrame};
use super::registry::{SessionRegistry, SharedCall};
use super::state::{CallState, CallTrigger};
use crate::config::EngineConfig;
use crate::signaling::{CallControl, ControlChannel, ControlTransport, InboundSignal, SignalMessage, SignalingError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// EVENTS
// ============================================================================

/// Events, die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Eingehender Anruf, wartet auf `answer` oder `end_call`
    IncomingCall(Call),

    StateChanged {
        handle: CallHandle,
        chat: ChatId,
        state: CallState,
    },

    /// Endgültiger Snapshot eines beendeten Calls
    CallEnded(Call),

    /// Steuersignal der Gegenstelle wurde angewendet
    ControlReceived {
        handle: CallHandle,
        control: CallControl,
    },

    AudioFrame {
        handle: CallHandle,
        frame: Arc<AudioFrame>,
    },

    VideoFrame {
        handle: CallHandle,
        frame: Arc<VideoFrame>,
    },

    MicrophoneChanged(bool),

    Error {
        handle: Option<CallHandle>,
        kind: ErrorKind,
        message: String,
    },
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    config: EngineConfig,
    registry: SessionRegistry,
    media: MediaPipeline,
    control: ControlChannel,
    event_tx: broadcast::Sender<CallEvent>,
    microphone_enabled: AtomicBool,
}

impl CallEngine {
    pub fn new(
        config: EngineConfig,
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn ControlTransport>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let media = MediaPipeline::new(devices, config.audio_bitrate, config.default_camera);
        let control = ControlChannel::new(transport, config.control_retries, config.retry_delay());

        Self {
            config,
            registry: SessionRegistry::new(),
            media,
            control,
            event_tx,
            microphone_enabled: AtomicBool::new(true),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn media(&self) -> &MediaPipeline {
        &self.media
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Muss genau einmal vor allen anderen Befehlen aufgerufen werden
    pub fn setup(&self) -> Result<(), CallEngineError> {
        self.media.setup()
    }

    /// Wechselt die Standard-Kamera; `true` für die Frontkamera
    pub async fn switch_camera(&self, front: bool) -> Result<(), CallEngineError> {
        let position = CameraPosition::from_front(front);
        self.media.switch_camera(position).await
    }

    /// Kamera-Override für einen einzelnen Call
    pub async fn switch_camera_for_call(
        &self,
        handle: CallHandle,
        front: bool,
    ) -> Result<(), CallEngineError> {
        self.media.ensure_ready()?;
        let shared = self.registry.lookup(handle)?;
        let position = CameraPosition::from_front(front);

        let holds_camera = {
            let slot = shared.lock();
            if slot.call.state.is_terminal() {
                return Err(CallEngineError::CallNotActive(slot.call.state));
            }
            slot.camera.is_some()
        };

        if holds_camera {
            self.media.select_camera(position).await?;
        } else if !self.media.has_camera(position) {
            return Err(CallEngineError::UnsupportedHardware(format!("no {position} camera present")));
        }

        {
            let mut slot = shared.lock();
            slot.call.camera = Some(position);
            if let Some(lease) = slot.camera.as_mut() {
                lease.set_position(position);
            }
        }
        tracing::info!("Call {} switched to the {} camera", handle, position);
        Ok(())
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        &self,
        chat: ChatId,
        enable_audio: bool,
        enable_video: bool,
    ) -> Result<Call, CallEngineError> {
        self.media.ensure_ready()?;
        if !enable_audio && !enable_video {
            return Err(CallEngineError::InvalidStateTransition(
                "a call needs audio or video to start".to_string(),
            ));
        }

        let bitrate = self.config.audio_bitrate.default;
        let shared = self.registry.create(
            chat.clone(),
            CallDirection::Outgoing,
            enable_audio,
            enable_video,
            bitrate,
        )?;
        let handle = shared.lock().call.handle;

        if let Err(err) = self.acquire_media(&shared, handle, enable_audio, enable_video).await {
            self.registry.discard(handle);
            return Err(err);
        }

        self.set_microphone_enabled(true);
        let snapshot = shared.lock().call.clone();

        tracing::info!("Calling {} (audio: {}, video: {})", chat, enable_audio, enable_video);
        self.emit_state(&snapshot);

        let offer = SignalMessage::Offer {
            audio: enable_audio,
            video: enable_video,
            audio_bitrate: bitrate,
        };
        if let Err(err) = self.control.send(&chat, &offer).await {
            self.finish(&shared, EndReason::Unreachable);
            return Err(self.report(Some(handle), err));
        }

        Ok(snapshot)
    }

    /// Nimmt einen eingehenden Anruf an
    ///
    /// Ohne Audio und Video wird der Anruf stattdessen abgelehnt.
    pub async fn answer(
        &self,
        handle: CallHandle,
        enable_audio: bool,
        enable_video: bool,
    ) -> Result<Call, CallEngineError> {
        self.media.ensure_ready()?;
        let shared = self.registry.lookup(handle)?;

        let chat = {
            let slot = shared.lock();
            if slot.call.direction != CallDirection::Incoming || slot.call.state != CallState::Ringing {
                return Err(CallEngineError::transition(slot.call.state, CallTrigger::Accept));
            }
            slot.call.chat.clone()
        };

        if !enable_audio && !enable_video {
            tracing::info!("Answering {} without media, declining instead", chat);
            self.end_call(handle).await?;
            return self.call(handle);
        }

        self.acquire_media(&shared, handle, enable_audio, enable_video).await?;

        let accepted = {
            let mut slot = shared.lock();
            match slot.call.transition(CallTrigger::Accept) {
                Ok(_) => {
                    slot.call.audio_enabled = enable_audio;
                    slot.call.video_enabled = enable_video;
                    Ok(slot.call.clone())
                }
                // Inzwischen beendet: Kamera und Audio wieder abgeben
                Err(err) => Err((err, slot.camera.take(), slot.audio.take())),
            }
        };
        let snapshot = match accepted {
            Ok(snapshot) => snapshot,
            Err((err, camera, audio)) => {
                self.release_media(camera, audio);
                return Err(err);
            }
        };

        self.set_microphone_enabled(true);
        tracing::info!("Answered call from {} (audio: {}, video: {})", chat, enable_audio, enable_video);
        self.emit_state(&snapshot);

        let answer = SignalMessage::Answer {
            audio: enable_audio,
            video: enable_video,
        };
        self.control
            .send(&chat, &answer)
            .await
            .map_err(|err| self.report(Some(handle), err))?;

        Ok(snapshot)
    }

    /// Schaltet das Senden von Video für einen laufenden Call ein oder aus
    pub async fn enable_video(&self, handle: CallHandle, enable: bool) -> Result<Call, CallEngineError> {
        let shared = self.registry.lookup(handle)?;

        let (snapshot, activate, released) = {
            let mut slot = shared.lock();
            let state = slot.call.state;
            if !state.is_in_progress() {
                return Err(CallEngineError::CallNotActive(state));
            }

            let mut activate = None;
            let mut released = None;
            if enable {
                if slot.camera.is_none() {
                    let lease = self.media.acquire_camera(handle, slot.call.camera)?;
                    activate = Some(lease.position());
                    slot.camera = Some(lease);
                }
            } else {
                released = slot.camera.take();
            }
            slot.call.video_enabled = enable;
            (slot.call.clone(), activate, released)
        };

        if let Some(lease) = released {
            self.media.release_camera(lease);
        }
        if let Some(position) = activate {
            if let Err(err) = self.media.select_camera(position).await {
                let lease = {
                    let mut slot = shared.lock();
                    slot.call.video_enabled = false;
                    slot.camera.take()
                };
                self.release_media(lease, None);
                return Err(err);
            }
        }

        tracing::debug!("Video sending for call {} set to {}", handle, enable);

        if !snapshot.has_media() {
            tracing::info!("Call {} has no media left, ending it", handle);
            let ended = self.finish(&shared, EndReason::NoMedia).unwrap_or(snapshot);
            self.control
                .send_once(&ended.chat, &SignalMessage::Hangup)
                .await
                .map_err(|err| self.report(Some(handle), err))?;
            return Ok(ended);
        }

        let update = SignalMessage::Media {
            audio: snapshot.audio_enabled,
            video: snapshot.video_enabled,
        };
        self.control
            .send(&snapshot.chat, &update)
            .await
            .map_err(|err| self.report(Some(handle), err))?;

        Ok(snapshot)
    }

    /// Audio auf den Lautsprecher (`true`) oder das Standardgerät legen
    pub fn route_audio(&self, to_speaker: bool) -> Result<(), CallEngineError> {
        self.media.route_audio(to_speaker).map(|_| ())
    }

    /// Sendet ein Steuersignal und wendet es lokal an
    pub async fn send_control(
        &self,
        handle: CallHandle,
        control: CallControl,
    ) -> Result<(), CallEngineError> {
        if control == CallControl::Cancel {
            return self.end_call(handle).await;
        }

        let shared = self.registry.lookup(handle)?;

        let (chat, state_change) = {
            let mut slot = shared.lock();
            let state = slot.call.state;
            if !state.is_in_progress() {
                return Err(CallEngineError::CallNotActive(state));
            }

            let state_change = match control {
                CallControl::Pause => Some(slot.call.transition(CallTrigger::Hold)?),
                CallControl::Resume => Some(slot.call.transition(CallTrigger::Resume)?),
                CallControl::HideVideo => {
                    slot.call.receiving_video = false;
                    None
                }
                CallControl::ShowVideo => {
                    slot.call.receiving_video = true;
                    None
                }
                CallControl::BitrateChange { audio_kbps } => {
                    self.media.validate_bitrate(audio_kbps)?;
                    slot.call.audio_bitrate = audio_kbps;
                    None
                }
                CallControl::MuteAudio | CallControl::UnmuteAudio | CallControl::Cancel => None,
            };
            (slot.call.chat.clone(), state_change.map(|_| slot.call.clone()))
        };

        match control {
            CallControl::MuteAudio => self.set_microphone_enabled(false),
            CallControl::UnmuteAudio => self.set_microphone_enabled(true),
            _ => {}
        }
        if let Some(call) = state_change {
            self.emit_state(&call);
        }

        tracing::debug!("Sending control {} to {}", control, chat);
        self.control
            .send(&chat, &SignalMessage::Control { control })
            .await
            .map_err(|err| self.report(Some(handle), err))
    }

    /// Beendet einen Call; für bereits beendete Calls ein No-op
    ///
    /// Der Call ist lokal sofort beendet. Das Hangup-Signal wird genau einmal
    /// gesendet; schlägt es fehl, kommt der Fehler zurück, der Zustand bleibt.
    pub async fn end_call(&self, handle: CallHandle) -> Result<(), CallEngineError> {
        let shared = self.registry.lookup(handle)?;

        let Some(ended) = self.finish(&shared, EndReason::Local) else {
            return Ok(());
        };

        self.control
            .send_once(&ended.chat, &SignalMessage::Hangup)
            .await
            .map_err(|err| self.report(Some(handle), err))
    }

    /// Setzt die Audio-Bitrate eines laufenden Calls (kbit/s)
    pub fn set_audio_bitrate(&self, handle: CallHandle, bitrate: u32) -> Result<(), CallEngineError> {
        let shared = self.registry.lookup(handle)?;
        let mut slot = shared.lock();

        let state = slot.call.state;
        if !state.is_in_progress() {
            return Err(CallEngineError::CallNotActive(state));
        }
        self.media.validate_bitrate(bitrate)?;

        slot.call.audio_bitrate = bitrate;
        tracing::debug!("Audio bitrate for call {} set to {} kbit/s", handle, bitrate);
        Ok(())
    }

    /// Liefert die lokale Video-Preview asynchron an `completion`
    ///
    /// `completion` läuft genau einmal, nie synchron im Aufruf; ohne
    /// laufenden Video-Call mit `None`. Braucht eine Tokio-Runtime.
    pub fn get_video_preview<F>(&self, completion: F)
    where
        F: FnOnce(Option<FrameSink>) + Send + 'static,
    {
        self.media.preview(self.registry.has_active_video(), completion);
    }

    pub async fn video_preview(&self) -> Option<FrameSink> {
        self.media.preview_async(self.registry.has_active_video()).await
    }

    /// Video der Gegenstelle
    pub fn video_feed(&self) -> FrameSink {
        self.media.remote_feed()
    }

    /// Rein lokal, wird nicht an die Gegenstelle gemeldet
    pub fn set_microphone_enabled(&self, enabled: bool) {
        let previous = self.microphone_enabled.swap(enabled, Ordering::SeqCst);
        self.media.set_microphone_enabled(enabled);
        if previous != enabled {
            tracing::debug!("Microphone enabled: {}", enabled);
            self.emit(CallEvent::MicrophoneChanged(enabled));
        }
    }

    pub fn microphone_enabled(&self) -> bool {
        self.microphone_enabled.load(Ordering::SeqCst)
    }

    // ========================================================================
    // QUERIES & HOUSEKEEPING
    // ========================================================================

    pub fn call(&self, handle: CallHandle) -> Result<Call, CallEngineError> {
        let shared = self.registry.lookup(handle)?;
        let call = shared.lock().call.clone();
        Ok(call)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.registry.snapshots()
    }

    /// Laufender Call eines Chats
    pub fn call_for_chat(&self, chat: &ChatId) -> Option<Call> {
        let shared = self.registry.lookup_chat(chat)?;
        let call = shared.lock().call.clone();
        Some(call)
    }

    /// Entfernt einen beendeten Call aus der Registry
    pub fn remove_call(&self, handle: CallHandle) -> Result<Call, CallEngineError> {
        self.registry.remove(handle)
    }

    pub fn purge_ended(&self) -> usize {
        self.registry.purge_ended()
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Verarbeitet ein Signal vom Transport
    pub async fn handle_inbound(&self, signal: InboundSignal) {
        match signal {
            InboundSignal::Message { from, message } => self.handle_message(from, message).await,
            InboundSignal::Unreachable { peer } => {
                let Some(shared) = self.registry.lookup_chat(&peer) else {
                    return;
                };
                let dialing = shared.lock().call.state == CallState::Dialing;
                if dialing {
                    tracing::info!("Peer {} is unreachable, ending call", peer);
                    self.finish(&shared, EndReason::Unreachable);
                }
            }
        }
    }

    async fn handle_message(&self, from: ChatId, message: SignalMessage) {
        match message {
            SignalMessage::Offer {
                audio,
                video,
                audio_bitrate,
            } => self.on_offer(from, audio, video, audio_bitrate).await,
            SignalMessage::Ringing => self.on_ringing(&from),
            SignalMessage::Answer { audio, video } => self.on_answer(&from, audio, video),
            SignalMessage::Media { audio, video } => self.on_media(&from, audio, video),
            SignalMessage::Control { control } => self.on_control(&from, control),
            SignalMessage::Hangup => self.on_remote_end(&from, EndReason::Remote, false),
            SignalMessage::Busy => self.on_busy(&from),
        }
    }

    async fn on_offer(&self, from: ChatId, audio: bool, video: bool, audio_bitrate: u32) {
        let created = self.media.ensure_ready().and_then(|_| {
            self.registry
                .create(from.clone(), CallDirection::Incoming, false, false, self.config.audio_bitrate.default)
        });

        let shared = match created {
            Ok(shared) => shared,
            Err(err) => {
                tracing::warn!("Rejecting call from {}: {}", from, err);
                self.emit_error(None, &err);
                if let Err(e) = self.control.send_once(&from, &SignalMessage::Busy).await {
                    tracing::warn!("Could not send busy to {}: {}", from, e);
                }
                return;
            }
        };

        let snapshot = {
            let mut slot = shared.lock();
            slot.call.peer_audio_enabled = audio;
            slot.call.peer_video_enabled = video;
            if self.media.validate_bitrate(audio_bitrate).is_ok() {
                slot.call.audio_bitrate = audio_bitrate;
            }
            slot.call.clone()
        };

        tracing::info!("Incoming call from {} (audio: {}, video: {})", from, audio, video);
        self.emit(CallEvent::IncomingCall(snapshot.clone()));
        self.emit_state(&snapshot);

        if let Err(e) = self.control.send_once(&from, &SignalMessage::Ringing).await {
            tracing::warn!("Could not send ringing to {}: {}", from, e);
        }
    }

    fn on_ringing(&self, from: &ChatId) {
        let Some(shared) = self.outgoing_call(from) else {
            return;
        };
        let result = shared.lock().call.transition(CallTrigger::PeerRinging);
        self.apply_remote_result(&shared, result);
    }

    fn on_answer(&self, from: &ChatId, audio: bool, video: bool) {
        let Some(shared) = self.outgoing_call(from) else {
            return;
        };

        // Ringing wurde evtl. nie zugestellt
        let skipped_ringing = {
            let mut slot = shared.lock();
            if slot.call.state == CallState::Dialing {
                slot.call.transition(CallTrigger::PeerRinging).ok().map(|_| slot.call.clone())
            } else {
                None
            }
        };
        if let Some(call) = skipped_ringing {
            self.emit_state(&call);
        }

        let result = {
            let mut slot = shared.lock();
            slot.call.peer_audio_enabled = audio;
            slot.call.peer_video_enabled = video;
            slot.call.transition(CallTrigger::Accept)
        };
        self.apply_remote_result(&shared, result);
    }

    fn on_media(&self, from: &ChatId, audio: bool, video: bool) {
        let Some(shared) = self.registry.lookup_chat(from) else {
            tracing::warn!("Media update from {} without a call", from);
            return;
        };
        let mut slot = shared.lock();
        slot.call.peer_audio_enabled = audio;
        slot.call.peer_video_enabled = video;
    }

    fn on_control(&self, from: &ChatId, control: CallControl) {
        let Some(shared) = self.registry.lookup_chat(from) else {
            tracing::warn!("Control {} from {} without a call", control, from);
            return;
        };

        if control == CallControl::Cancel {
            self.on_remote_end(from, EndReason::Remote, false);
            return;
        }

        let (handle, result) = {
            let mut slot = shared.lock();
            let handle = slot.call.handle;
            let state = slot.call.state;

            let result = if !state.is_in_progress() {
                Err(CallEngineError::CallNotActive(state))
            } else {
                match control {
                    CallControl::Pause => slot.call.transition(CallTrigger::Hold).map(Some),
                    CallControl::Resume => slot.call.transition(CallTrigger::Resume).map(Some),
                    CallControl::MuteAudio => {
                        slot.call.peer_audio_muted = true;
                        Ok(None)
                    }
                    CallControl::UnmuteAudio => {
                        slot.call.peer_audio_muted = false;
                        Ok(None)
                    }
                    CallControl::HideVideo => {
                        slot.call.sending_video_paused = true;
                        Ok(None)
                    }
                    CallControl::ShowVideo => {
                        slot.call.sending_video_paused = false;
                        Ok(None)
                    }
                    CallControl::BitrateChange { audio_kbps } => {
                        slot.call.peer_audio_bitrate = Some(audio_kbps);
                        Ok(None)
                    }
                    CallControl::Cancel => Ok(None),
                }
            };
            (handle, result.map(|changed| changed.map(|_| slot.call.clone())))
        };

        match result {
            Ok(changed) => {
                if let Some(call) = changed {
                    self.emit_state(&call);
                }
                tracing::debug!("Applied control {} from {}", control, from);
                self.emit(CallEvent::ControlReceived { handle, control });
            }
            Err(err) => {
                tracing::warn!("Ignoring control {} from {}: {}", control, from, err);
                self.emit_error(Some(handle), &err);
            }
        }
    }

    fn on_remote_end(&self, from: &ChatId, reason: EndReason, only_outgoing: bool) {
        let shared = if only_outgoing {
            self.outgoing_call(from)
        } else {
            self.registry.lookup_chat(from)
        };

        if let Some(shared) = shared {
            tracing::info!("Call with {} ended by peer ({})", from, reason);
            self.finish(&shared, reason);
        }
    }

    /// Busy gilt nur vor der Annahme
    fn on_busy(&self, from: &ChatId) {
        let Some(shared) = self.outgoing_call(from) else {
            return;
        };
        let state = shared.lock().call.state;
        if matches!(state, CallState::Dialing | CallState::Ringing) {
            self.on_remote_end(from, EndReason::Busy, true);
        } else {
            tracing::warn!("Ignoring busy from {} for a call in state {}", from, state);
        }
    }

    // ========================================================================
    // MEDIA FRAMES
    // ========================================================================

    /// Audio der Gegenstelle an die Anwendung weiterreichen
    pub fn deliver_audio_frame(&self, chat: &ChatId, frame: AudioFrame) -> Result<(), CallEngineError> {
        let handle = self.in_progress_handle(chat)?;
        self.emit(CallEvent::AudioFrame {
            handle,
            frame: Arc::new(frame),
        });
        Ok(())
    }

    /// Video der Gegenstelle an Feed und Anwendung weiterreichen
    pub fn deliver_video_frame(&self, chat: &ChatId, frame: VideoFrame) -> Result<(), CallEngineError> {
        let handle = self.in_progress_handle(chat)?;
        let frame = Arc::new(frame);
        self.media.push_remote_frame(Arc::clone(&frame));
        self.emit(CallEvent::VideoFrame { handle, frame });
        Ok(())
    }

    /// Frame der eigenen Kamera für die Preview
    pub fn push_preview_frame(&self, frame: VideoFrame) {
        self.media.push_preview_frame(frame);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Kamera reservieren und einschalten, Audio starten.
    /// Bei Fehler bleibt nichts belegt.
    async fn acquire_media(
        &self,
        shared: &SharedCall,
        handle: CallHandle,
        audio: bool,
        video: bool,
    ) -> Result<(), CallEngineError> {
        let camera = if video {
            let position = shared.lock().call.camera;
            let lease = self.media.acquire_camera(handle, position)?;
            self.media.activate_camera(&lease).await?;
            Some(lease)
        } else {
            None
        };

        let audio = if audio {
            match self.media.start_audio() {
                Ok(lease) => Some(lease),
                Err(err) => {
                    self.release_media(camera, None);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let state = {
            let mut slot = shared.lock();
            let state = slot.call.state;
            if !state.is_terminal() {
                if camera.is_some() {
                    slot.camera = camera;
                }
                if audio.is_some() {
                    slot.audio = audio;
                }
                return Ok(());
            }
            state
        };

        // Während des Geräte-Umschaltens beendet
        self.release_media(camera, audio);
        Err(CallEngineError::CallNotActive(state))
    }

    fn release_media(&self, camera: Option<CameraLease>, audio: Option<AudioLease>) {
        if let Some(lease) = camera {
            self.media.release_camera(lease);
        }
        drop(audio);
    }

    fn outgoing_call(&self, from: &ChatId) -> Option<SharedCall> {
        let shared = self.registry.lookup_chat(from)?;
        let outgoing = shared.lock().call.direction == CallDirection::Outgoing;
        if outgoing {
            Some(shared)
        } else {
            tracing::warn!("Ignoring signal from {}: no outgoing call", from);
            None
        }
    }

    fn in_progress_handle(&self, chat: &ChatId) -> Result<CallHandle, CallEngineError> {
        let shared = self
            .registry
            .lookup_chat(chat)
            .ok_or_else(|| CallEngineError::NotFound(format!("no call with {chat}")))?;
        let slot = shared.lock();
        if slot.call.state.is_in_progress() {
            Ok(slot.call.handle)
        } else {
            Err(CallEngineError::CallNotActive(slot.call.state))
        }
    }

    fn apply_remote_result(&self, shared: &SharedCall, result: Result<CallState, CallEngineError>) {
        let call = shared.lock().call.clone();
        match result {
            Ok(_) => self.emit_state(&call),
            Err(err) => {
                tracing::warn!("Ignoring signal from {}: {}", call.chat, err);
                self.emit_error(Some(call.handle), &err);
            }
        }
    }

    /// Beendet einen Call lokal und gibt seine Ressourcen frei.
    /// `None` wenn er schon beendet war.
    fn finish(&self, shared: &SharedCall, reason: EndReason) -> Option<Call> {
        let (ended, camera, audio) = {
            let mut slot = shared.lock();
            if !slot.call.end(reason) {
                return None;
            }
            (slot.call.clone(), slot.camera.take(), slot.audio.take())
        };

        self.registry.release(ended.handle, &ended.chat);
        self.release_media(camera, audio);

        tracing::info!("Call {} with {} ended ({})", ended.handle, ended.chat, reason);
        self.emit_state(&ended);
        self.emit(CallEvent::CallEnded(ended.clone()));
        Some(ended)
    }

    fn report(&self, handle: Option<CallHandle>, err: SignalingError) -> CallEngineError {
        let err = CallEngineError::from(err);
        self.emit_error(handle, &err);
        err
    }

    fn emit_state(&self, call: &Call) {
        self.emit(CallEvent::StateChanged {
            handle: call.handle,
            chat: call.chat.clone(),
            state: call.state,
        });
    }

    fn emit_error(&self, handle: Option<CallHandle>, err: &CallEngineError) {
        self.emit(CallEvent::Error {
            handle,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// Blockiert nie; ohne Empfänger geht das Event verloren
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("registry", &self.registry)
            .field("media", &self.media)
            .field("microphone_enabled", &self.microphone_enabled())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::VirtualDevices;
    use crate::signaling::{MemoryNetwork, MemoryTransport};
    use tokio::sync::{mpsc, oneshot};

    struct Harness {
        engine: CallEngine,
        transport: Arc<MemoryTransport>,
        devices: Arc<VirtualDevices>,
        bob_rx: mpsc::Receiver<InboundSignal>,
        _carol_rx: mpsc::Receiver<InboundSignal>,
        events: broadcast::Receiver<CallEvent>,
    }

    fn harness() -> Harness {
        let network = MemoryNetwork::new();
        let (transport, _me_rx) = network.endpoint("me");
        let (_bob, bob_rx) = network.endpoint("bob");
        let (_carol, carol_rx) = network.endpoint("carol");
        let transport = Arc::new(transport);
        let devices = Arc::new(VirtualDevices::new());

        let config = EngineConfig {
            retry_delay_ms: 0,
            ..EngineConfig::default()
        };
        let engine = CallEngine::new(config, devices.clone(), transport.clone());
        engine.setup().unwrap();
        let events = engine.subscribe();

        Harness {
            engine,
            transport,
            devices,
            bob_rx,
            _carol_rx: carol_rx,
            events,
        }
    }

    fn bob() -> ChatId {
        ChatId::new("bob")
    }

    fn from_bob(message: SignalMessage) -> InboundSignal {
        InboundSignal::Message {
            from: bob(),
            message,
        }
    }

    fn received(rx: &mut mpsc::Receiver<InboundSignal>) -> Vec<SignalMessage> {
        let mut messages = Vec::new();
        while let Ok(InboundSignal::Message { message, .. }) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[CallEvent]) -> Vec<CallState> {
        events
            .iter()
            .filter_map(|event| match event {
                CallEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_outgoing_call() {
        let mut h = harness();

        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        assert_eq!(call.state, CallState::Dialing);
        assert!(h.devices.audio_running());
        assert_eq!(
            received(&mut h.bob_rx),
            vec![SignalMessage::Offer {
                audio: true,
                video: false,
                audio_bitrate: 48
            }]
        );

        h.engine.handle_inbound(from_bob(SignalMessage::Ringing)).await;
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Ringing);

        h.engine
            .handle_inbound(from_bob(SignalMessage::Answer {
                audio: true,
                video: true,
            }))
            .await;
        let active = h.engine.call(call.handle).unwrap();
        assert_eq!(active.state, CallState::Active);
        assert!(active.peer_video_enabled);
        assert!(active.answered_at.is_some());

        h.engine.send_control(call.handle, CallControl::Pause).await.unwrap();
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::OnHold);
        h.engine.send_control(call.handle, CallControl::Resume).await.unwrap();

        h.engine.set_audio_bitrate(call.handle, 64).unwrap();
        assert_eq!(h.engine.call(call.handle).unwrap().audio_bitrate, 64);

        h.engine.end_call(call.handle).await.unwrap();
        let ended = h.engine.call(call.handle).unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::Local));
        assert!(!h.devices.audio_running());

        assert_eq!(
            received(&mut h.bob_rx),
            vec![
                SignalMessage::Control {
                    control: CallControl::Pause
                },
                SignalMessage::Control {
                    control: CallControl::Resume
                },
                SignalMessage::Hangup,
            ]
        );

        let events = drain(&mut h.events);
        assert_eq!(
            states(&events),
            vec![
                CallState::Dialing,
                CallState::Ringing,
                CallState::Active,
                CallState::OnHold,
                CallState::Active,
                CallState::Ended,
            ]
        );
        assert!(events.iter().any(|e| matches!(e, CallEvent::CallEnded(c) if c.handle == call.handle)));
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();

        h.engine.end_call(call.handle).await.unwrap();
        let first = h.engine.call(call.handle).unwrap();
        drain(&mut h.events);

        h.engine.end_call(call.handle).await.unwrap();
        assert_eq!(h.engine.call(call.handle).unwrap(), first);
        assert!(drain(&mut h.events).is_empty());

        let hangups = h
            .transport
            .sent()
            .into_iter()
            .filter(|(_, m)| *m == SignalMessage::Hangup)
            .count();
        assert_eq!(hangups, 1);
    }

    #[tokio::test]
    async fn test_enable_video_while_dialing() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();

        let err = h.engine.enable_video(call.handle, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallNotActive);

        let after = h.engine.call(call.handle).unwrap();
        assert_eq!(after.state, CallState::Dialing);
        assert!(!after.video_enabled);
        assert_eq!(h.engine.media().camera_owner(), None);
    }

    #[tokio::test]
    async fn test_bitrate_out_of_range_keeps_previous() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: false })).await;

        h.engine.set_audio_bitrate(call.handle, 32).unwrap();
        for bad in [0, 5, 511, 10_000] {
            let err = h.engine.set_audio_bitrate(call.handle, bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidBitrate);
        }
        assert_eq!(h.engine.call(call.handle).unwrap().audio_bitrate, 32);
    }

    #[tokio::test]
    async fn test_bitrate_on_ended_call() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.end_call(call.handle).await.unwrap();

        let err = h.engine.set_audio_bitrate(call.handle, 1000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallNotActive);
    }

    #[tokio::test]
    async fn test_concurrent_start_same_chat() {
        let h = harness();

        let (a, b) = tokio::join!(
            h.engine.start_call(bob(), true, false),
            h.engine.start_call(bob(), true, true),
        );

        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::DuplicateCall))
            .count();
        assert_eq!((ok, duplicates), (1, 1));
        assert_eq!(h.engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_camera_busy_across_calls() {
        let h = harness();
        let first = h.engine.start_call(bob(), true, true).await.unwrap();
        assert_eq!(h.engine.media().camera_owner(), Some(first.handle));

        let err = h.engine.start_call("carol".into(), true, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);

        // Fehlgeschlagener Start belegt den Chat nicht
        assert!(h.engine.call_for_chat(&"carol".into()).is_none());
        let audio_only = h.engine.start_call("carol".into(), true, false).await.unwrap();
        assert_eq!(audio_only.state, CallState::Dialing);

        h.engine.end_call(first.handle).await.unwrap();
        assert_eq!(h.engine.media().camera_owner(), None);
    }

    #[tokio::test]
    async fn test_transport_failure_on_end_keeps_ended() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        drain(&mut h.events);

        h.transport.fail_next(SignalingError::SendFailed("relay down".into()));
        let err = h.engine.end_call(call.handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Ended);

        let events = drain(&mut h.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, CallEvent::Error { kind: ErrorKind::Transport, .. })));
    }

    #[tokio::test]
    async fn test_transient_control_failure_is_retried() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Ringing)).await;
        h.engine
            .handle_inbound(from_bob(SignalMessage::Answer {
                audio: true,
                video: false,
            }))
            .await;
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Active);
        received(&mut h.bob_rx);

        h.transport.fail_next(SignalingError::Timeout);
        h.engine.send_control(call.handle, CallControl::Pause).await.unwrap();
        assert_eq!(
            received(&mut h.bob_rx),
            vec![SignalMessage::Control {
                control: CallControl::Pause
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_ends_call_unreachable() {
        let h = harness();
        let err = h.engine.start_call("dave".into(), true, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let calls = h.engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].state, CallState::Ended);
        assert_eq!(calls[0].end_reason, Some(EndReason::Unreachable));
        assert!(h.engine.call_for_chat(&"dave".into()).is_none());
    }

    #[tokio::test]
    async fn test_commands_before_setup() {
        let network = MemoryNetwork::new();
        let (transport, _rx) = network.endpoint("me");
        let engine = CallEngine::new(
            EngineConfig::default(),
            Arc::new(VirtualDevices::new()),
            Arc::new(transport),
        );

        let err = engine.start_call(bob(), true, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(engine.route_audio(true).unwrap_err().kind(), ErrorKind::DeviceUnavailable);

        engine.setup().unwrap();
        assert_eq!(engine.setup().unwrap_err().kind(), ErrorKind::AlreadyInitialized);
    }

    #[tokio::test]
    async fn test_start_without_media_rejected() {
        let h = harness();
        let err = h.engine.start_call(bob(), false, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_incoming_call_answered() {
        let mut h = harness();
        h.engine
            .handle_inbound(from_bob(SignalMessage::Offer {
                audio: true,
                video: true,
                audio_bitrate: 32,
            }))
            .await;

        let events = drain(&mut h.events);
        let incoming = events
            .iter()
            .find_map(|e| match e {
                CallEvent::IncomingCall(call) => Some(call.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(incoming.state, CallState::Ringing);
        assert_eq!(incoming.direction, CallDirection::Incoming);
        assert_eq!(incoming.audio_bitrate, 32);
        assert_eq!(received(&mut h.bob_rx), vec![SignalMessage::Ringing]);

        let call = h.engine.answer(incoming.handle, true, true).await.unwrap();
        assert_eq!(call.state, CallState::Active);
        assert_eq!(h.engine.media().camera_owner(), Some(call.handle));
        assert_eq!(
            received(&mut h.bob_rx),
            vec![SignalMessage::Answer {
                audio: true,
                video: true
            }]
        );

        let err = h.engine.answer(incoming.handle, true, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_answer_without_media_declines() {
        let mut h = harness();
        h.engine
            .handle_inbound(from_bob(SignalMessage::Offer {
                audio: true,
                video: false,
                audio_bitrate: 48,
            }))
            .await;
        let handle = h.engine.call_for_chat(&bob()).unwrap().handle;
        received(&mut h.bob_rx);

        let call = h.engine.answer(handle, false, false).await.unwrap();
        assert_eq!(call.state, CallState::Ended);
        assert_eq!(received(&mut h.bob_rx), vec![SignalMessage::Hangup]);
    }

    #[tokio::test]
    async fn test_answer_outgoing_call_rejected() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        let err = h.engine.answer(call.handle, true, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_second_offer_gets_busy() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        received(&mut h.bob_rx);

        h.engine
            .handle_inbound(from_bob(SignalMessage::Offer {
                audio: true,
                video: false,
                audio_bitrate: 48,
            }))
            .await;

        assert_eq!(received(&mut h.bob_rx), vec![SignalMessage::Busy]);
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Dialing);
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, CallEvent::Error { kind: ErrorKind::DuplicateCall, .. })));
    }

    #[tokio::test]
    async fn test_busy_and_hangup_from_peer() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Busy)).await;
        assert_eq!(h.engine.call(call.handle).unwrap().end_reason, Some(EndReason::Busy));

        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: false })).await;
        h.engine.handle_inbound(from_bob(SignalMessage::Hangup)).await;
        assert_eq!(h.engine.call(call.handle).unwrap().end_reason, Some(EndReason::Remote));
    }

    #[tokio::test]
    async fn test_busy_ignored_after_answer() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: false })).await;
        h.engine.handle_inbound(from_bob(SignalMessage::Busy)).await;
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Active);
    }

    #[tokio::test]
    async fn test_unreachable_ends_dialing_call() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(InboundSignal::Unreachable { peer: bob() }).await;

        let ended = h.engine.call(call.handle).unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::Unreachable));
    }

    #[tokio::test]
    async fn test_mute_control_toggles_microphone() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: false })).await;
        drain(&mut h.events);

        h.engine.send_control(call.handle, CallControl::MuteAudio).await.unwrap();
        assert!(!h.engine.microphone_enabled());
        assert!(!h.devices.microphone_enabled());
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, CallEvent::MicrophoneChanged(false))));

        h.engine.send_control(call.handle, CallControl::UnmuteAudio).await.unwrap();
        assert!(h.engine.microphone_enabled());
    }

    #[tokio::test]
    async fn test_remote_controls_update_peer_flags() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, true).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: true })).await;
        drain(&mut h.events);

        for control in [
            CallControl::MuteAudio,
            CallControl::HideVideo,
            CallControl::BitrateChange { audio_kbps: 24 },
        ] {
            h.engine.handle_inbound(from_bob(SignalMessage::Control { control })).await;
        }

        let updated = h.engine.call(call.handle).unwrap();
        assert!(updated.peer_audio_muted);
        assert!(updated.sending_video_paused);
        assert_eq!(updated.peer_audio_bitrate, Some(24));

        let received_controls = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::ControlReceived { .. }))
            .count();
        assert_eq!(received_controls, 3);

        h.engine
            .handle_inbound(from_bob(SignalMessage::Control {
                control: CallControl::Pause,
            }))
            .await;
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::OnHold);
    }

    #[tokio::test]
    async fn test_disable_last_media_ends_call() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), false, true).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: true })).await;
        received(&mut h.bob_rx);

        let ended = h.engine.enable_video(call.handle, false).await.unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::NoMedia));
        assert_eq!(h.engine.media().camera_owner(), None);
        assert_eq!(received(&mut h.bob_rx), vec![SignalMessage::Hangup]);
    }

    #[tokio::test]
    async fn test_enable_video_on_active_call() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Ringing)).await;
        h.engine
            .handle_inbound(from_bob(SignalMessage::Answer {
                audio: true,
                video: false,
            }))
            .await;
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Active);
        received(&mut h.bob_rx);

        let updated = h.engine.enable_video(call.handle, true).await.unwrap();
        assert!(updated.video_enabled);
        assert_eq!(h.engine.media().camera_owner(), Some(call.handle));
        assert_eq!(
            received(&mut h.bob_rx),
            vec![SignalMessage::Media {
                audio: true,
                video: true
            }]
        );

        h.engine.enable_video(call.handle, false).await.unwrap();
        assert_eq!(h.engine.media().camera_owner(), None);
    }

    #[tokio::test]
    async fn test_switch_camera_for_call() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, true).await.unwrap();

        h.engine.switch_camera_for_call(call.handle, false).await.unwrap();
        assert_eq!(h.engine.call(call.handle).unwrap().camera, Some(CameraPosition::Rear));
        assert_eq!(h.devices.selected_camera(), Some(CameraPosition::Rear));

        h.engine.switch_camera(true).await.unwrap();
        assert_eq!(h.engine.media().default_camera(), CameraPosition::Front);
    }

    #[tokio::test]
    async fn test_camera_override_applied_on_enable_video() {
        let mut h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();
        h.engine.handle_inbound(from_bob(SignalMessage::Ringing)).await;
        h.engine
            .handle_inbound(from_bob(SignalMessage::Answer {
                audio: true,
                video: false,
            }))
            .await;
        assert_eq!(h.engine.call(call.handle).unwrap().state, CallState::Active);
        received(&mut h.bob_rx);

        h.engine.switch_camera_for_call(call.handle, false).await.unwrap();
        assert_eq!(h.devices.selected_camera(), Some(CameraPosition::Front));

        h.engine.enable_video(call.handle, true).await.unwrap();
        assert_eq!(h.devices.selected_camera(), Some(CameraPosition::Rear));
        assert_eq!(h.engine.media().default_camera(), CameraPosition::Front);

        // Nach dem Ende gilt wieder der Default am Gerät
        h.engine.end_call(call.handle).await.unwrap();
        let mut restored = false;
        for _ in 0..100 {
            if h.devices.selected_camera() == Some(CameraPosition::Front) {
                restored = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(restored);
    }

    #[tokio::test]
    async fn test_audio_runs_while_any_call_uses_it() {
        let h = harness();
        let first = h.engine.start_call(bob(), true, false).await.unwrap();
        let second = h.engine.start_call("carol".into(), true, false).await.unwrap();
        assert_eq!(h.engine.media().audio_users(), 2);

        h.engine.end_call(first.handle).await.unwrap();
        assert!(h.devices.audio_running());
        assert_eq!(h.engine.media().audio_users(), 1);

        h.engine.end_call(second.handle).await.unwrap();
        assert!(!h.devices.audio_running());
        assert_eq!(h.engine.media().audio_users(), 0);
    }

    #[tokio::test]
    async fn test_hangup_during_answer_releases_media() {
        let h = harness();
        h.engine
            .handle_inbound(from_bob(SignalMessage::Offer {
                audio: true,
                video: true,
                audio_bitrate: 48,
            }))
            .await;
        let handle = h.engine.call_for_chat(&bob()).unwrap().handle;

        // Hangup kann vor, während oder nach dem Umschalten der Kamera eintreffen
        let (answered, _) = tokio::join!(
            h.engine.answer(handle, true, true),
            h.engine.handle_inbound(from_bob(SignalMessage::Hangup)),
        );
        if let Err(err) = answered {
            assert!(matches!(
                err.kind(),
                ErrorKind::CallNotActive | ErrorKind::InvalidStateTransition
            ));
        }

        assert_eq!(h.engine.call(handle).unwrap().state, CallState::Ended);
        assert_eq!(h.engine.media().camera_owner(), None);
        assert_eq!(h.engine.media().audio_users(), 0);
        assert!(!h.devices.audio_running());
    }

    #[test]
    fn test_video_preview_without_runtime() {
        let network = MemoryNetwork::new();
        let (transport, _rx) = network.endpoint("me");
        let engine = CallEngine::new(
            EngineConfig::default(),
            Arc::new(VirtualDevices::new()),
            Arc::new(transport),
        );
        engine.setup().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        engine.get_video_preview(move |sink| {
            let _ = tx.send(sink.is_none());
        });
        assert!(rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap());
    }

    #[tokio::test]
    async fn test_video_preview() {
        let h = harness();
        assert!(h.engine.video_preview().await.is_none());

        let (tx, rx) = oneshot::channel();
        h.engine.start_call(bob(), true, true).await.unwrap();
        h.engine.get_video_preview(move |sink| {
            let _ = tx.send(sink.is_some());
        });
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_frames_require_live_call() {
        let mut h = harness();
        let frame = VideoFrame {
            width: 1,
            height: 1,
            y: vec![0],
            u: vec![0],
            v: vec![0],
        };
        let err = h.engine.deliver_video_frame(&bob(), frame.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        h.engine.start_call(bob(), true, true).await.unwrap();
        let err = h.engine.deliver_video_frame(&bob(), frame.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallNotActive);

        h.engine.handle_inbound(from_bob(SignalMessage::Answer { audio: true, video: true })).await;
        drain(&mut h.events);
        h.engine.deliver_video_frame(&bob(), frame).unwrap();

        assert!(h.engine.video_feed().latest().is_some());
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, CallEvent::VideoFrame { .. })));
    }

    #[tokio::test]
    async fn test_remove_and_purge() {
        let h = harness();
        let call = h.engine.start_call(bob(), true, false).await.unwrap();

        let err = h.engine.remove_call(call.handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

        h.engine.end_call(call.handle).await.unwrap();
        h.engine.start_call(bob(), true, false).await.unwrap();
        assert_eq!(h.engine.calls().len(), 2);

        assert_eq!(h.engine.purge_ended(), 1);
        assert_eq!(h.engine.remove_call(call.handle).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
