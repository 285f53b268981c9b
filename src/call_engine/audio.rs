//! Audio-Geräte über cpal
//!
//! Mikrofon Capture und Playback für Desktop-Systeme. Kameras bietet
//! dieses Backend nicht an; Video-Calls scheitern mit `UnsupportedHardware`.
//!
//! cpal-Streams sind nicht `Send`, daher leben sie auf einem eigenen
//! Audio-Thread, der über Kommandos gesteuert wird.

use super::call::{CameraPosition, MediaRoute};
use super::media::{AudioFrame, DeviceError, MediaDevices};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Mono für Voice
pub const CHANNELS: u16 = 1;

/// 20ms @ 48kHz
pub const FRAME_SIZE: usize = 960;

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

type SampleBuffer = Arc<Mutex<HeapRb<f32>>>;

// ============================================================================
// CPAL DEVICES
// ============================================================================

pub struct CpalDevices {
    capture_buffer: SampleBuffer,
    playback_buffer: SampleBuffer,
    muted: Arc<AtomicBool>,
    route: Mutex<MediaRoute>,
    worker: Mutex<Option<AudioWorker>>,
}

struct AudioWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl CpalDevices {
    pub fn new() -> Self {
        Self {
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            muted: Arc::new(AtomicBool::new(false)),
            route: Mutex::new(MediaRoute::Default),
            worker: Mutex::new(None),
        }
    }

    /// Liest einen 20ms-Frame vom Mikrofon, falls genug Samples anliegen
    pub fn read_frame(&self) -> Option<AudioFrame> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }

        let pcm = (0..FRAME_SIZE)
            .filter_map(|_| buffer.try_pop())
            .map(to_i16)
            .collect();
        Some(AudioFrame {
            pcm,
            channels: CHANNELS as u8,
            sample_rate: SAMPLE_RATE,
        })
    }

    /// Schreibt Audio der Gegenstelle in den Playback-Buffer
    pub fn write_frame(&self, frame: &AudioFrame) {
        let channels = frame.channels.max(1) as usize;
        let mut buffer = self.playback_buffer.lock();

        // Downmix auf Mono: erster Kanal
        for sample in frame.pcm.iter().step_by(channels) {
            let _ = buffer.try_push(*sample as f32 / i16::MAX as f32);
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDevices for CpalDevices {
    fn probe(&self) -> Result<(), DeviceError> {
        let host = cpal::default_host();
        if host.default_input_device().is_none() {
            return Err(DeviceError::NoAudioDevice("no audio input device found".to_string()));
        }
        if host.default_output_device().is_none() {
            return Err(DeviceError::NoAudioDevice("no audio output device found".to_string()));
        }
        tracing::info!("Audio devices available: {}Hz, {} channel(s)", SAMPLE_RATE, CHANNELS);
        Ok(())
    }

    fn has_camera(&self, _position: CameraPosition) -> bool {
        false
    }

    fn select_camera(&self, position: CameraPosition) -> Result<(), DeviceError> {
        Err(DeviceError::NoCamera(position))
    }

    fn route_audio(&self, route: MediaRoute) -> Result<(), DeviceError> {
        // Desktop-Hosts kennen nur das Standardgerät
        *self.route.lock() = route;
        tracing::debug!("Audio route set to {:?} (default output device)", route);
        Ok(())
    }

    fn set_microphone_enabled(&self, enabled: bool) {
        self.muted.store(!enabled, Ordering::SeqCst);
        tracing::debug!("Audio muted: {}", !enabled);
    }

    fn start_audio(&self) -> Result<(), DeviceError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();
        let capture = Arc::clone(&self.capture_buffer);
        let playback = Arc::clone(&self.playback_buffer);
        let muted = Arc::clone(&self.muted);

        let thread = std::thread::Builder::new()
            .name("avcall-audio".to_string())
            .spawn(move || {
                let streams = start_capture(capture, muted)
                    .and_then(|input| start_playback(playback).map(|output| (input, output)));

                match streams {
                    Ok(_streams) => {
                        let _ = ready_tx.send(Ok(()));
                        // Streams leben bis zum Stop-Kommando
                        let _ = stop_rx.recv();
                        tracing::info!("Audio streams stopped");
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })
            .map_err(|e| DeviceError::Io(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| DeviceError::Io("audio thread exited".to_string()))??;

        *worker = Some(AudioWorker { stop_tx, thread });
        Ok(())
    }

    fn stop_audio(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop_tx.send(());
        if worker.thread.join().is_err() {
            tracing::error!("Audio thread panicked");
        }
        self.capture_buffer.lock().clear();
        self.playback_buffer.lock().clear();
    }
}

impl Drop for CpalDevices {
    fn drop(&mut self) {
        self.stop_audio();
    }
}

impl std::fmt::Debug for CpalDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalDevices")
            .field("running", &self.is_running())
            .field("muted", &self.muted.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// STREAMS
// ============================================================================

fn start_capture(buffer: SampleBuffer, muted: Arc<AtomicBool>) -> Result<Stream, DeviceError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| DeviceError::NoAudioDevice("no audio input device found".to_string()))?;
    let config = find_best_config(&device, true)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let source_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if muted.load(Ordering::Relaxed) {
                    return;
                }

                let mono: Vec<f32> = data.iter().step_by(channels.max(1)).copied().collect();
                let samples = resample(&mono, source_rate, SAMPLE_RATE);

                let mut buffer = buffer.lock();
                for sample in samples {
                    let _ = buffer.try_push(sample);
                }
            },
            |err| tracing::error!("Audio capture error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Io(e.to_string()))?;

    stream.play().map_err(|e| DeviceError::Io(e.to_string()))?;
    Ok(stream)
}

fn start_playback(buffer: SampleBuffer) -> Result<Stream, DeviceError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| DeviceError::NoAudioDevice("no audio output device found".to_string()))?;
    let config = find_best_config(&device, false)?;

    tracing::info!(
        "Starting audio playback: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels as usize;
    let ratio = SAMPLE_RATE as f32 / config.sample_rate.0 as f32;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buffer = buffer.lock();
                let frames = data.len() / channels.max(1);
                let mut position = 0.0f32;
                let mut sample = 0.0f32;

                for i in 0..frames {
                    // Einfaches Sample-and-Hold Resampling
                    position += ratio;
                    while position >= 1.0 {
                        sample = buffer.try_pop().unwrap_or(0.0);
                        position -= 1.0;
                    }
                    for c in 0..channels {
                        if let Some(out) = data.get_mut(i * channels + c) {
                            *out = sample;
                        }
                    }
                }
            },
            |err| tracing::error!("Audio playback error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Io(e.to_string()))?;

    stream.play().map_err(|e| DeviceError::Io(e.to_string()))?;
    Ok(stream)
}

fn find_best_config(device: &Device, input: bool) -> Result<StreamConfig, DeviceError> {
    let configs: Vec<SupportedStreamConfigRange> = if input {
        device
            .supported_input_configs()
            .map_err(|e| DeviceError::Io(e.to_string()))?
            .collect()
    } else {
        device
            .supported_output_configs()
            .map_err(|e| DeviceError::Io(e.to_string()))?
            .collect()
    };
    select_best_config(&configs)
}

/// Priorität: F32 mit 48kHz, dann F32 mit höchster Rate
fn select_best_config(configs: &[SupportedStreamConfigRange]) -> Result<StreamConfig, DeviceError> {
    let target = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = || configs.iter().filter(|c| c.sample_format() == SampleFormat::F32);

    if let Some(config) = f32_configs().find(|c| c.min_sample_rate() <= target && c.max_sample_rate() >= target) {
        return Ok(config.with_sample_rate(target).into());
    }
    if let Some(config) = f32_configs().next() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(DeviceError::Io("no f32 audio configuration found".to_string()))
}

/// Lineares Resampling
fn resample(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || data.is_empty() {
        return data.to_vec();
    }

    let ratio = to as f32 / from as f32;
    let len = (data.len() as f32 * ratio) as usize;
    (0..len)
        .map(|i| {
            let src = i as f32 / ratio;
            let idx = src as usize;
            let frac = src - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_doubles_length() {
        let out = resample(&[0.0, 1.0, 0.0, -1.0], 24000, 48000);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let data = [0.1, 0.2, 0.3];
        assert_eq!(resample(&data, SAMPLE_RATE, SAMPLE_RATE), data.to_vec());
    }

    #[test]
    fn test_to_i16_clamps() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
    }

    #[test]
    fn test_frame_round_trip_through_buffers() {
        let devices = CpalDevices::new();
        assert!(devices.read_frame().is_none());

        let frame = AudioFrame {
            pcm: vec![1000; FRAME_SIZE],
            channels: 1,
            sample_rate: SAMPLE_RATE,
        };
        devices.write_frame(&frame);
        assert_eq!(devices.playback_buffer.lock().occupied_len(), FRAME_SIZE);

        {
            let mut capture = devices.capture_buffer.lock();
            for _ in 0..FRAME_SIZE {
                let _ = capture.try_push(0.5);
            }
        }
        let read = devices.read_frame().unwrap();
        assert_eq!(read.sample_count(), FRAME_SIZE);
        assert_eq!(read.pcm[0], to_i16(0.5));
    }

    #[test]
    fn test_no_cameras() {
        let devices = CpalDevices::new();
        assert!(!devices.has_camera(CameraPosition::Front));
        assert!(matches!(
            devices.select_camera(CameraPosition::Rear),
            Err(DeviceError::NoCamera(CameraPosition::Rear))
        ));
    }
}
