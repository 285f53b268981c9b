//! Media Pipeline Controller
//!
//! Verwaltet:
//! - Einmaliges Setup der Geräte
//! - Kamera-Auswahl und exklusive Kamera-Nutzung pro Call
//! - Audio-Routing (Lautsprecher / Standard)
//! - Validierung der Audio-Bitrate
//! - Preview- und Remote-Video als [`FrameSink`]
//!
//! Plattform-Geräte stecken hinter dem [`MediaDevices`] Trait.

use super::call::{CallHandle, CameraPosition, MediaRoute};
use super::error::CallEngineError;
use crate::config::BitrateRange;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("No audio device available: {0}")]
    NoAudioDevice(String),

    #[error("No {0} camera present")]
    NoCamera(CameraPosition),

    #[error("Device I/O failed: {0}")]
    Io(String),
}

// ============================================================================
// DEVICE BACKEND
// ============================================================================

/// Plattform-Geräte (Mikrofon, Lautsprecher, Kameras)
///
/// Die Methoden dürfen blockieren; der Controller ruft kamerabezogene
/// Methoden über `spawn_blocking` auf.
pub trait MediaDevices: Send + Sync + 'static {
    /// Prüft beim Setup, ob Audio-Geräte vorhanden sind
    fn probe(&self) -> Result<(), DeviceError>;

    fn has_camera(&self, position: CameraPosition) -> bool;

    fn select_camera(&self, position: CameraPosition) -> Result<(), DeviceError>;

    fn route_audio(&self, route: MediaRoute) -> Result<(), DeviceError>;

    fn set_microphone_enabled(&self, _enabled: bool) {}

    /// Startet Capture/Playback für den ersten laufenden Call
    fn start_audio(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Stoppt Capture/Playback wenn kein Call mehr läuft
    fn stop_audio(&self) {}
}

/// In-Memory Geräte ohne Hardware (Headless-Betrieb und Tests)
#[derive(Debug)]
pub struct VirtualDevices {
    cameras: Vec<CameraPosition>,
    audio_available: bool,
    selected_camera: Mutex<Option<CameraPosition>>,
    route: Mutex<MediaRoute>,
    microphone: AtomicBool,
    audio_running: AtomicBool,
}

impl VirtualDevices {
    /// Front- und Rückkamera, Audio vorhanden
    pub fn new() -> Self {
        Self::with_cameras(vec![CameraPosition::Front, CameraPosition::Rear])
    }

    pub fn with_cameras(cameras: Vec<CameraPosition>) -> Self {
        Self {
            cameras,
            audio_available: true,
            selected_camera: Mutex::new(None),
            route: Mutex::new(MediaRoute::Default),
            microphone: AtomicBool::new(true),
            audio_running: AtomicBool::new(false),
        }
    }

    pub fn without_audio(mut self) -> Self {
        self.audio_available = false;
        self
    }

    pub fn selected_camera(&self) -> Option<CameraPosition> {
        *self.selected_camera.lock()
    }

    pub fn route(&self) -> MediaRoute {
        *self.route.lock()
    }

    pub fn microphone_enabled(&self) -> bool {
        self.microphone.load(Ordering::SeqCst)
    }

    pub fn audio_running(&self) -> bool {
        self.audio_running.load(Ordering::SeqCst)
    }
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDevices for VirtualDevices {
    fn probe(&self) -> Result<(), DeviceError> {
        if self.audio_available {
            Ok(())
        } else {
            Err(DeviceError::NoAudioDevice("virtual audio disabled".to_string()))
        }
    }

    fn has_camera(&self, position: CameraPosition) -> bool {
        self.cameras.contains(&position)
    }

    fn select_camera(&self, position: CameraPosition) -> Result<(), DeviceError> {
        if !self.has_camera(position) {
            return Err(DeviceError::NoCamera(position));
        }
        *self.selected_camera.lock() = Some(position);
        Ok(())
    }

    fn route_audio(&self, route: MediaRoute) -> Result<(), DeviceError> {
        *self.route.lock() = route;
        Ok(())
    }

    fn set_microphone_enabled(&self, enabled: bool) {
        self.microphone.store(enabled, Ordering::SeqCst);
    }

    fn start_audio(&self) -> Result<(), DeviceError> {
        self.audio_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_audio(&self) {
        self.audio_running.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// FRAMES
// ============================================================================

/// Video-Frame im YUV420-Format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u16,
    pub height: u16,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

/// Audio-Frame, interleaved PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub pcm: Vec<i16>,
    pub channels: u8,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn sample_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.pcm.len() / self.channels as usize
        }
    }
}

/// Renderbarer Zugriff auf den jeweils neuesten Video-Frame
#[derive(Debug, Clone)]
pub struct FrameSink {
    rx: watch::Receiver<Option<Arc<VideoFrame>>>,
}

impl FrameSink {
    fn new(rx: watch::Receiver<Option<Arc<VideoFrame>>>) -> Self {
        Self { rx }
    }

    pub fn latest(&self) -> Option<Arc<VideoFrame>> {
        self.rx.borrow().clone()
    }

    /// Wartet auf den nächsten Frame; `None` wenn die Quelle weg ist
    pub async fn next_frame(&mut self) -> Option<Arc<VideoFrame>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }
}

// ============================================================================
// CAMERA LEASE
// ============================================================================

type CameraOwner = Arc<Mutex<Option<CallHandle>>>;

/// Exklusiver Kamera-Besitz eines Calls; wird beim Drop freigegeben
pub struct CameraLease {
    owner: CameraOwner,
    handle: CallHandle,
    position: CameraPosition,
}

impl CameraLease {
    /// Kamera, die dieser Call nutzt
    pub fn position(&self) -> CameraPosition {
        self.position
    }

    pub(crate) fn set_position(&mut self, position: CameraPosition) {
        self.position = position;
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        let mut owner = self.owner.lock();
        if *owner == Some(self.handle) {
            *owner = None;
            tracing::debug!("Camera released by call {}", self.handle);
        }
    }
}

impl std::fmt::Debug for CameraLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraLease")
            .field("handle", &self.handle)
            .field("position", &self.position)
            .finish()
    }
}

// ============================================================================
// AUDIO LEASE
// ============================================================================

struct AudioUsers {
    devices: Arc<dyn MediaDevices>,
    count: Mutex<usize>,
}

/// Audio-Nutzung eines Calls; der letzte Drop stoppt Capture/Playback
pub struct AudioLease {
    users: Arc<AudioUsers>,
}

impl Drop for AudioLease {
    fn drop(&mut self) {
        // Zählen und Stoppen unter demselben Lock wie das Starten
        let mut count = self.users.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.users.devices.stop_audio();
            tracing::debug!("Audio stopped, no call uses it anymore");
        }
    }
}

impl std::fmt::Debug for AudioLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLease").finish_non_exhaustive()
    }
}

/// Führt `job` verzögert aus, nie im Aufruf selbst
///
/// Mit Tokio-Runtime auf deren Blocking-Pool, sonst auf einem eigenen Thread.
fn defer<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => {
            if let Err(e) = std::thread::Builder::new()
                .name("avcall-deferred".to_string())
                .spawn(job)
            {
                tracing::error!("Failed to spawn deferred job: {}", e);
            }
        }
    }
}

// ============================================================================
// MEDIA PIPELINE
// ============================================================================

pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    bitrate: BitrateRange,
    initialized: AtomicBool,
    camera_owner: CameraOwner,
    audio_users: Arc<AudioUsers>,
    default_camera: Mutex<CameraPosition>,
    route: Mutex<MediaRoute>,
    preview_tx: watch::Sender<Option<Arc<VideoFrame>>>,
    remote_tx: watch::Sender<Option<Arc<VideoFrame>>>,
}

impl MediaPipeline {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        bitrate: BitrateRange,
        default_camera: CameraPosition,
    ) -> Self {
        let (preview_tx, _) = watch::channel(None);
        let (remote_tx, _) = watch::channel(None);

        let audio_users = Arc::new(AudioUsers {
            devices: Arc::clone(&devices),
            count: Mutex::new(0),
        });

        Self {
            devices,
            bitrate,
            initialized: AtomicBool::new(false),
            camera_owner: Arc::new(Mutex::new(None)),
            audio_users,
            default_camera: Mutex::new(default_camera),
            route: Mutex::new(MediaRoute::Default),
            preview_tx,
            remote_tx,
        }
    }

    /// Einmaliges Setup; ein fehlgeschlagenes Setup darf wiederholt werden
    pub fn setup(&self) -> Result<(), CallEngineError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(CallEngineError::AlreadyInitialized);
        }

        self.devices.probe()?;

        let camera = *self.default_camera.lock();
        if self.devices.has_camera(camera) {
            self.devices.select_camera(camera)?;
        } else {
            tracing::warn!("Default {} camera not present, video calls need a switch", camera);
        }

        self.initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CallEngineError::AlreadyInitialized)?;

        tracing::info!("Media pipeline initialized (camera: {})", camera);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn ensure_ready(&self) -> Result<(), CallEngineError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CallEngineError::DeviceUnavailable(
                "media pipeline not set up, call setup() first".to_string(),
            ))
        }
    }

    pub fn default_camera(&self) -> CameraPosition {
        *self.default_camera.lock()
    }

    pub fn route(&self) -> MediaRoute {
        *self.route.lock()
    }

    pub fn bitrate_range(&self) -> BitrateRange {
        self.bitrate
    }

    pub fn has_camera(&self, position: CameraPosition) -> bool {
        self.devices.has_camera(position)
    }

    /// Wechselt die globale Standard-Kamera (asynchron, Geräte-I/O)
    pub async fn switch_camera(&self, position: CameraPosition) -> Result<(), CallEngineError> {
        self.ensure_ready()?;
        self.select_camera(position).await?;
        *self.default_camera.lock() = position;
        tracing::info!("Switched default camera to {}", position);
        Ok(())
    }

    /// Wählt eine Kamera am Gerät aus, ohne den Default zu ändern
    pub async fn select_camera(&self, position: CameraPosition) -> Result<(), CallEngineError> {
        if !self.devices.has_camera(position) {
            return Err(DeviceError::NoCamera(position).into());
        }

        let devices = Arc::clone(&self.devices);
        tokio::task::spawn_blocking(move || devices.select_camera(position))
            .await
            .map_err(|e| CallEngineError::DeviceUnavailable(e.to_string()))??;
        Ok(())
    }

    /// Reserviert die Kamera für einen Call
    ///
    /// Nur der Besitz wird vergeben; das Gerät schaltet erst
    /// [`MediaPipeline::activate_camera`] um.
    pub fn acquire_camera(
        &self,
        handle: CallHandle,
        position: Option<CameraPosition>,
    ) -> Result<CameraLease, CallEngineError> {
        let position = position.unwrap_or_else(|| self.default_camera());
        if !self.devices.has_camera(position) {
            return Err(DeviceError::NoCamera(position).into());
        }

        let mut owner = self.camera_owner.lock();
        match *owner {
            Some(current) if current != handle => {
                return Err(CallEngineError::DeviceBusy {
                    device: "camera",
                    owner: current,
                })
            }
            _ => *owner = Some(handle),
        }

        tracing::debug!("Camera ({}) acquired by call {}", position, handle);
        Ok(CameraLease {
            owner: Arc::clone(&self.camera_owner),
            handle,
            position,
        })
    }

    /// Schaltet das Gerät auf die Kamera eines frisch reservierten Leases
    pub async fn activate_camera(&self, lease: &CameraLease) -> Result<(), CallEngineError> {
        self.select_camera(lease.position()).await
    }

    /// Gibt eine Kamera frei und stellt den Default am Gerät wieder her,
    /// falls der Call einen Override nutzte
    pub fn release_camera(&self, lease: CameraLease) {
        let used = lease.position();
        drop(lease);

        let default = self.default_camera();
        if used != default && self.devices.has_camera(default) {
            let devices = Arc::clone(&self.devices);
            defer(move || {
                if let Err(e) = devices.select_camera(default) {
                    tracing::warn!("Could not restore the {} camera: {}", default, e);
                }
            });
        }
    }

    pub fn camera_owner(&self) -> Option<CallHandle> {
        *self.camera_owner.lock()
    }

    pub fn validate_bitrate(&self, bitrate: u32) -> Result<(), CallEngineError> {
        if self.bitrate.contains(bitrate) {
            Ok(())
        } else {
            Err(CallEngineError::InvalidBitrate {
                bitrate,
                min: self.bitrate.min,
                max: self.bitrate.max,
            })
        }
    }

    /// Globales Audio-Routing, unabhängig von einzelnen Calls
    pub fn route_audio(&self, to_speaker: bool) -> Result<MediaRoute, CallEngineError> {
        self.ensure_ready()?;
        let route = if to_speaker {
            MediaRoute::Speaker
        } else {
            MediaRoute::Default
        };
        self.devices.route_audio(route)?;
        *self.route.lock() = route;
        tracing::info!("Audio routed to {:?}", route);
        Ok(route)
    }

    pub fn set_microphone_enabled(&self, enabled: bool) {
        self.devices.set_microphone_enabled(enabled);
    }

    /// Startet Audio für einen weiteren Call; das Gerät startet nur beim ersten
    pub fn start_audio(&self) -> Result<AudioLease, CallEngineError> {
        let mut count = self.audio_users.count.lock();
        if *count == 0 {
            self.devices.start_audio()?;
            tracing::debug!("Audio started");
        }
        *count += 1;

        Ok(AudioLease {
            users: Arc::clone(&self.audio_users),
        })
    }

    /// Anzahl der Calls, die gerade Audio nutzen
    pub fn audio_users(&self) -> usize {
        *self.audio_users.count.lock()
    }

    /// Liefert die Preview verzögert an `completion`, genau einmal.
    ///
    /// Funktioniert mit und ohne Tokio-Runtime.
    pub fn preview<F>(&self, video_active: bool, completion: F)
    where
        F: FnOnce(Option<FrameSink>) + Send + 'static,
    {
        let sink = video_active.then(|| FrameSink::new(self.preview_tx.subscribe()));
        defer(move || completion(sink));
    }

    /// Wie [`MediaPipeline::preview`], als Future
    pub async fn preview_async(&self, video_active: bool) -> Option<FrameSink> {
        let (tx, rx) = oneshot::channel();
        self.preview(video_active, move |sink| {
            let _ = tx.send(sink);
        });
        rx.await.ok().flatten()
    }

    pub fn push_preview_frame(&self, frame: VideoFrame) {
        self.preview_tx.send_replace(Some(Arc::new(frame)));
    }

    pub fn push_remote_frame(&self, frame: Arc<VideoFrame>) {
        self.remote_tx.send_replace(Some(frame));
    }

    pub fn remote_feed(&self) -> FrameSink {
        FrameSink::new(self.remote_tx.subscribe())
    }
}

impl std::fmt::Debug for MediaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPipeline")
            .field("initialized", &self.is_initialized())
            .field("default_camera", &self.default_camera())
            .field("route", &self.route())
            .field("camera_owner", &self.camera_owner())
            .field("audio_users", &self.audio_users())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
